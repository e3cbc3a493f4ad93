//! Scripted vertices, ops, and executors for solver tests.
//!
//! `Harness` owns the shared cache and op registry; `VertexBuilder` scripts
//! one vertex's keying and execution behavior. Builders with identical
//! name/salt/inputs produce identical vertex digests, which is how tests
//! exercise structural dedup.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};
use serde::Serialize;

use crate::cache::InMemoryCache;
use crate::config::SolverConfig;
use crate::core::artifact::{Artifact, ArtifactRef};
use crate::core::cancel::CancelToken;
use crate::core::digest::Digest;
use crate::core::op::{CacheMap, CacheMapDep, Op, OpResolver};
use crate::core::vertex::{Edge, OutputIndex, Vertex, VertexOptions};
use crate::solver::{Solver, SolverOpt};

pub type ExecFn =
    Arc<dyn Fn(&CancelToken, &[ArtifactRef]) -> anyhow::Result<Vec<ArtifactRef>> + Send + Sync>;

/// Shared environment for one test: cache, op registry, release accounting.
pub struct Harness {
    cache: Arc<InMemoryCache>,
    resolver: Arc<ScriptedResolver>,
    /// Underlying releases of artifacts produced by scripted executors.
    pub underlying_releases: Arc<AtomicUsize>,
    /// Total scripted executions across all ops.
    pub total_execs: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cache: InMemoryCache::new(),
            resolver: Arc::new(ScriptedResolver::default()),
            underlying_releases: Arc::new(AtomicUsize::new(0)),
            total_execs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A fresh solver instance sharing this harness's cache and registry.
    /// Scenario "second run on a new scheduler with a populated cache" spins
    /// up a second one.
    pub fn solver(&self) -> Solver {
        Solver::new(SolverOpt {
            resolver: Arc::clone(&self.resolver) as Arc<dyn OpResolver>,
            cache: Arc::clone(&self.cache) as Arc<dyn crate::cache::CacheManager>,
            config: SolverConfig::default(),
        })
    }

    pub fn cache(&self) -> &Arc<InMemoryCache> {
        &self.cache
    }

    pub fn vertex(&self, name: &str) -> VertexBuilder<'_> {
        VertexBuilder {
            harness: self,
            name: name.to_string(),
            salt: String::new(),
            op_digest: None,
            inputs: Vec::new(),
            options: VertexOptions::default(),
            deps: HashMap::new(),
            exec: ExecBehavior::Produce,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct ScriptedResolver {
    ops: Mutex<HashMap<Digest, Arc<TestOp>>>,
}

impl ScriptedResolver {
    /// First registration wins, mirroring vertex dedup: two builders with the
    /// same digest share one op (and one exec counter).
    fn register(&self, digest: Digest, op: Arc<TestOp>) -> Arc<TestOp> {
        let mut ops = self.ops.lock().expect("op registry lock");
        Arc::clone(ops.entry(digest).or_insert(op))
    }
}

impl OpResolver for ScriptedResolver {
    fn resolve(&self, vertex: &Arc<dyn Vertex>) -> anyhow::Result<Arc<dyn Op>> {
        let ops = self.ops.lock().expect("op registry lock");
        ops.get(&vertex.digest())
            .map(|op| Arc::clone(op) as Arc<dyn Op>)
            .ok_or_else(|| anyhow::anyhow!("no scripted op for vertex {}", vertex.name()))
    }
}

/// Artifact whose underlying release is counted by the harness.
pub struct CountingArtifact {
    id: String,
    data: Vec<u8>,
    releases: Arc<AtomicUsize>,
}

impl CountingArtifact {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Artifact for CountingArtifact {
    fn id(&self) -> &str {
        &self.id
    }

    fn release(&self) -> anyhow::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Bytes carried by a scripted artifact, for assertions and content digests.
pub fn artifact_data(artifact: &ArtifactRef) -> Vec<u8> {
    let any = artifact.artifact().as_any();
    if let Some(counting) = any.downcast_ref::<CountingArtifact>() {
        return counting.data().to_vec();
    }
    if let Some(data) = any.downcast_ref::<crate::core::artifact::DataArtifact>() {
        return data.data().to_vec();
    }
    Vec::new() // sentinel and foreign artifacts have no scripted content
}

/// Content-digest function hashing the scripted artifact's bytes.
pub fn content_digest_fn() -> crate::core::op::ContentDigestFn {
    Arc::new(|_token, artifact| Ok(Digest::of_bytes(&artifact_data(artifact))))
}

#[derive(Clone, Default)]
struct DepSpec {
    selector: Option<Digest>,
    content_digest: bool,
    optional: bool,
}

enum ExecBehavior {
    /// Produce one output: `name>` followed by the input bytes.
    Produce,
    /// Fail with this message.
    Fail(String),
    /// Custom closure.
    Custom(ExecFn),
}

/// Probe into a gated executor, for cancellation tests.
pub struct ExecProbe {
    pub started: Receiver<()>,
    pub cancelled: Receiver<()>,
    release: Sender<()>,
}

impl ExecProbe {
    /// Let a gated executor finish normally.
    pub fn release(&self) {
        let _ = self.release.try_send(());
    }
}

pub struct VertexBuilder<'a> {
    harness: &'a Harness,
    name: String,
    salt: String,
    op_digest: Option<Digest>,
    inputs: Vec<Edge>,
    options: VertexOptions,
    deps: HashMap<usize, DepSpec>,
    exec: ExecBehavior,
}

impl<'a> VertexBuilder<'a> {
    /// Extra digest material: distinguishes otherwise-identical vertices.
    pub fn salt(mut self, salt: &str) -> Self {
        self.salt = salt.to_string();
        self
    }

    /// Base cache-map digest. Two vertices sharing it are the same
    /// instruction at different graph positions. Defaults to a digest of the
    /// vertex name and salt.
    pub fn op_digest(mut self, material: &str) -> Self {
        self.op_digest = Some(Digest::of_bytes(material.as_bytes()));
        self
    }

    pub fn input(mut self, edge: Edge) -> Self {
        self.inputs.push(edge);
        self
    }

    pub fn ignore_cache(mut self) -> Self {
        self.options.ignore_cache = true;
        self
    }

    pub fn skip_merge(mut self) -> Self {
        self.options.skip_merge = true;
        self
    }

    pub fn dep_selector(mut self, index: usize, selector: &str) -> Self {
        self.deps.entry(index).or_default().selector = Some(Digest::of_bytes(selector.as_bytes()));
        self
    }

    /// Mark input `index` as contributing a slow key from its content.
    pub fn dep_content_digest(mut self, index: usize) -> Self {
        self.deps.entry(index).or_default().content_digest = true;
        self
    }

    pub fn dep_optional(mut self, index: usize) -> Self {
        self.deps.entry(index).or_default().optional = true;
        self
    }

    pub fn exec_err(mut self, msg: &str) -> Self {
        self.exec = ExecBehavior::Fail(msg.to_string());
        self
    }

    pub fn exec_fn(mut self, f: ExecFn) -> Self {
        self.exec = ExecBehavior::Custom(f);
        self
    }

    /// Gate execution: the op reports start, then blocks until released or
    /// cancelled.
    pub fn exec_gated(mut self) -> (Self, ExecProbe) {
        let (started_tx, started_rx) = bounded(4);
        let (cancelled_tx, cancelled_rx) = bounded(4);
        let (release_tx, release_rx) = bounded::<()>(4);
        let releases = Arc::clone(&self.harness.underlying_releases);
        let name = self.name.clone();
        self.exec = ExecBehavior::Custom(Arc::new(move |token, _inputs| {
            let _ = started_tx.try_send(());
            let cancel_rx = token.subscribe();
            crossbeam::select! {
                recv(release_rx) -> _ => {
                    Ok(vec![counting_artifact(&name, b"gated", &releases)])
                }
                recv(cancel_rx) -> _ => {
                    let _ = cancelled_tx.try_send(());
                    Err(anyhow::anyhow!("executor cancelled"))
                }
            }
        }));
        (
            self,
            ExecProbe {
                started: started_rx,
                cancelled: cancelled_rx,
                release: release_tx,
            },
        )
    }

    pub fn build(self) -> TestNode {
        #[derive(Serialize)]
        struct Material<'m> {
            name: &'m str,
            salt: &'m str,
            inputs: Vec<(Digest, usize)>,
            ignore_cache: bool,
            skip_merge: bool,
        }
        let digest = Digest::of_canonical(&Material {
            name: &self.name,
            salt: &self.salt,
            inputs: self
                .inputs
                .iter()
                .map(|e| (e.vertex.digest(), e.output.0))
                .collect(),
            ignore_cache: self.options.ignore_cache,
            skip_merge: self.options.skip_merge,
        })
        .expect("vertex material encodable");

        let op_digest = self
            .op_digest
            .unwrap_or_else(|| Digest::of_bytes(format!("op:{}:{}", self.name, self.salt).as_bytes()));

        let vertex: Arc<TestVertex> = Arc::new(TestVertex {
            name: self.name.clone(),
            digest,
            inputs: self.inputs.clone(),
            options: self.options,
        });

        let op = Arc::new(TestOp {
            name: self.name,
            op_digest,
            dep_count: self.inputs.len(),
            deps: self.deps,
            exec: self.exec,
            execs: AtomicUsize::new(0),
            total_execs: Arc::clone(&self.harness.total_execs),
            underlying_releases: Arc::clone(&self.harness.underlying_releases),
        });
        let op = self.harness.resolver.register(digest, op);

        TestNode { vertex, op }
    }
}

/// A scripted vertex plus its (possibly shared) op.
pub struct TestNode {
    vertex: Arc<TestVertex>,
    op: Arc<TestOp>,
}

impl TestNode {
    pub fn vertex(&self) -> Arc<dyn Vertex> {
        Arc::clone(&self.vertex) as Arc<dyn Vertex>
    }

    pub fn edge(&self, output: usize) -> Edge {
        Edge::new(self.vertex(), OutputIndex(output))
    }

    pub fn digest(&self) -> Digest {
        self.vertex.digest
    }

    /// Executions of this vertex's op. Shared between vertices deduped by
    /// digest.
    pub fn execs(&self) -> usize {
        self.op.execs.load(Ordering::SeqCst)
    }
}

pub struct TestVertex {
    name: String,
    digest: Digest,
    inputs: Vec<Edge>,
    options: VertexOptions,
}

impl Vertex for TestVertex {
    fn digest(&self) -> Digest {
        self.digest
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[Edge] {
        &self.inputs
    }

    fn options(&self) -> &VertexOptions {
        &self.options
    }
}

struct TestOp {
    name: String,
    op_digest: Digest,
    dep_count: usize,
    deps: HashMap<usize, DepSpec>,
    exec: ExecBehavior,
    execs: AtomicUsize,
    total_execs: Arc<AtomicUsize>,
    underlying_releases: Arc<AtomicUsize>,
}

impl Op for TestOp {
    fn cache_map(&self, _token: &CancelToken) -> anyhow::Result<CacheMap> {
        let deps = (0..self.dep_count)
            .map(|i| {
                let spec = self.deps.get(&i).cloned().unwrap_or_default();
                CacheMapDep {
                    selector: spec.selector,
                    content_digest: spec.content_digest.then(content_digest_fn),
                    optional: spec.optional,
                }
            })
            .collect();
        Ok(CacheMap {
            digest: self.op_digest,
            deps,
        })
    }

    fn exec(&self, token: &CancelToken, inputs: &[ArtifactRef]) -> anyhow::Result<Vec<ArtifactRef>> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.total_execs.fetch_add(1, Ordering::SeqCst);
        match &self.exec {
            ExecBehavior::Fail(msg) => Err(anyhow::anyhow!("{msg}")),
            ExecBehavior::Custom(f) => f(token, inputs),
            ExecBehavior::Produce => {
                let mut data = format!("{}>", self.name).into_bytes();
                for input in inputs {
                    data.extend(artifact_data(input));
                }
                Ok(vec![counting_artifact(
                    &self.name,
                    &data,
                    &self.underlying_releases,
                )])
            }
        }
    }
}

fn counting_artifact(name: &str, data: &[u8], releases: &Arc<AtomicUsize>) -> ArtifactRef {
    ArtifactRef::new(Arc::new(CountingArtifact {
        id: format!("{}-{}", name, uuid::Uuid::new_v4()),
        data: data.to_vec(),
        releases: Arc::clone(releases),
    }))
}
