//! Cache layer graph and the per-episode artifact layout.
//!
//! Every artifact belongs to exactly one layer. Layers form a fixed DAG whose edges point
//! from a layer to the layers derived from it. Invalidating a layer removes it together
//! with everything reachable downstream, before any episode worker starts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SubweaveError};

const TOMBSTONE_PREFIX: &str = ".trash-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Catalog,
    Video,
    Captions,
    SubsEs,
    SubsEn,
    SubsRu,
    SubsRefs,
    SubsDual,
    Mux,
}

impl Layer {
    pub const ALL: [Layer; 9] = [
        Layer::Catalog,
        Layer::Video,
        Layer::Captions,
        Layer::SubsEs,
        Layer::SubsEn,
        Layer::SubsRu,
        Layer::SubsRefs,
        Layer::SubsDual,
        Layer::Mux,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Layer::Catalog => "catalog",
            Layer::Video => "video",
            Layer::Captions => "captions",
            Layer::SubsEs => "subs_es",
            Layer::SubsEn => "subs_en",
            Layer::SubsRu => "subs_ru",
            Layer::SubsRefs => "subs_refs",
            Layer::SubsDual => "subs_dual",
            Layer::Mux => "mux",
        }
    }

    /// Layers built from this one ("depends-on-me" edges).
    pub fn dependents(self) -> &'static [Layer] {
        match self {
            Layer::Catalog => &[],
            Layer::Video => &[Layer::Captions, Layer::Mux],
            Layer::Captions => &[Layer::SubsEs, Layer::SubsEn, Layer::SubsRu, Layer::SubsRefs, Layer::Mux],
            Layer::SubsRu => &[Layer::SubsDual, Layer::Mux],
            Layer::SubsEs | Layer::SubsEn | Layer::SubsRefs | Layer::SubsDual => &[Layer::Mux],
            Layer::Mux => &[],
        }
    }

    /// Metadata layers live once per series, not per episode.
    pub fn is_episode_scoped(self) -> bool {
        self != Layer::Catalog
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layer {
    type Err = SubweaveError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Layer::ALL
            .iter()
            .copied()
            .find(|layer| layer.name() == wanted)
            .ok_or_else(|| SubweaveError::UnknownLayer(s.to_string()))
    }
}

/// Parse a comma-separated list of layer names.
pub fn parse_layer_list(raw: &str) -> Result<Vec<Layer>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Layer::from_str)
        .collect()
}

/// Static view over the layer DAG.
pub struct LayerGraph;

impl LayerGraph {
    /// Requested layers plus every layer reachable from them.
    pub fn closure(requested: &[Layer]) -> BTreeSet<Layer> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<Layer> = requested.iter().copied().collect();
        while let Some(layer) = queue.pop_front() {
            if closure.insert(layer) {
                queue.extend(layer.dependents().iter().copied());
            }
        }
        closure
    }

    /// Layers ordered so that every layer precedes its dependents.
    pub fn topological_order() -> Vec<Layer> {
        let mut indegree: HashMap<Layer, usize> = Layer::ALL.iter().map(|l| (*l, 0)).collect();
        for layer in Layer::ALL {
            for dep in layer.dependents() {
                *indegree.entry(*dep).or_default() += 1;
            }
        }

        let mut ready: VecDeque<Layer> = Layer::ALL
            .iter()
            .copied()
            .filter(|l| indegree[l] == 0)
            .collect();
        let mut order = Vec::with_capacity(Layer::ALL.len());
        while let Some(layer) = ready.pop_front() {
            order.push(layer);
            for dep in layer.dependents() {
                let remaining = indegree.entry(*dep).or_default();
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push_back(*dep);
                }
            }
        }
        order
    }

    /// Layers this layer is built from.
    pub fn upstream(layer: Layer) -> Vec<Layer> {
        Layer::ALL
            .iter()
            .copied()
            .filter(|l| l.dependents().contains(&layer))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOutcome {
    /// Layer removed in every in-scope namespace (count of directories removed)
    Cleared(usize),
    /// Layer left untouched
    Failed(String),
    /// Not attempted because an earlier layer failed
    Skipped,
}

#[derive(Debug, Clone)]
pub struct LayerResult {
    pub layer: Layer,
    pub outcome: LayerOutcome,
}

/// Result of the invalidation preflight, handed explicitly to every episode run.
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
    pub requested: BTreeSet<Layer>,
    pub closure: BTreeSet<Layer>,
    pub results: Vec<LayerResult>,
}

impl Invalidation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.outcome, LayerOutcome::Cleared(_)))
    }

    pub fn contains(&self, layer: Layer) -> bool {
        self.closure.contains(&layer)
    }

    pub fn first_failure(&self) -> Option<(Layer, String)> {
        self.results.iter().find_map(|r| match &r.outcome {
            LayerOutcome::Failed(reason) => Some((r.layer, reason.clone())),
            _ => None,
        })
    }
}

/// Paths of one episode's artifacts, one directory per layer.
#[derive(Debug, Clone)]
pub struct EpisodeLayout {
    pub episode_id: String,
    pub root: PathBuf,
}

impl EpisodeLayout {
    pub fn layer_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.name())
    }

    pub fn video_file(&self, extension: &str) -> PathBuf {
        self.layer_dir(Layer::Video).join(format!("episode.{}", extension))
    }

    /// Existing video artifact, whatever its container extension.
    pub fn existing_video(&self) -> Option<PathBuf> {
        let dir = self.layer_dir(Layer::Video);
        std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_stem().map(|s| s == "episode").unwrap_or(false)
                    && !p.to_string_lossy().ends_with(".partial")
            })
    }

    pub fn base_captions(&self) -> PathBuf {
        self.layer_dir(Layer::Captions).join("base.srt")
    }

    pub fn delay_file(&self) -> PathBuf {
        self.layer_dir(Layer::Captions).join("delay.json")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.layer_dir(Layer::Captions).join("scratch")
    }

    pub fn track_file(&self, layer: Layer) -> PathBuf {
        self.layer_dir(layer).join("track.srt")
    }

    pub fn chunk_dir(&self, layer: Layer) -> PathBuf {
        self.layer_dir(layer).join("chunks")
    }

    pub fn mux_file(&self) -> PathBuf {
        self.layer_dir(Layer::Mux).join(format!("{}.mkv", self.episode_id))
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for layer in Layer::ALL.iter().filter(|l| l.is_episode_scoped()) {
            fs::create_dir_all(self.layer_dir(*layer)).await?;
        }
        Ok(())
    }
}

/// Root of all artifacts: one namespace per episode plus the series catalog.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.root.join("_catalog")
    }

    pub fn episode(&self, episode_id: &str) -> EpisodeLayout {
        EpisodeLayout {
            episode_id: episode_id.to_string(),
            root: self.root.join(episode_id),
        }
    }

    fn layer_dirs(&self, layer: Layer, episodes: &[String]) -> Vec<PathBuf> {
        if layer.is_episode_scoped() {
            episodes.iter().map(|id| self.episode(id).layer_dir(layer)).collect()
        } else {
            vec![self.catalog_dir()]
        }
    }

    /// Compute the downstream closure of `requested` and clear it for `episodes`.
    ///
    /// Layers are cleared dependents-first, so a failure leaves every remaining layer
    /// consistent with its own upstream. Each layer is all-or-nothing across the scope.
    pub async fn invalidate(&self, requested: &[Layer], episodes: &[String]) -> Result<Invalidation> {
        let closure = LayerGraph::closure(requested);
        let mut invalidation = Invalidation {
            requested: requested.iter().copied().collect(),
            closure: closure.clone(),
            results: Vec::new(),
        };
        if closure.is_empty() {
            return Ok(invalidation);
        }

        info!(
            "Invalidating {} (closure: {})",
            join_layers(&invalidation.requested),
            join_layers(&closure)
        );

        let mut failed = false;
        for layer in LayerGraph::topological_order().into_iter().rev() {
            if !closure.contains(&layer) {
                continue;
            }
            if failed {
                invalidation.results.push(LayerResult { layer, outcome: LayerOutcome::Skipped });
                continue;
            }
            let outcome = match self.clear_layer(layer, episodes).await {
                Ok(removed) => {
                    debug!("Layer {} cleared ({} namespaces)", layer, removed);
                    LayerOutcome::Cleared(removed)
                }
                Err(e) => {
                    warn!("Layer {} could not be invalidated: {}", layer, e);
                    failed = true;
                    LayerOutcome::Failed(e.to_string())
                }
            };
            invalidation.results.push(LayerResult { layer, outcome });
        }

        Ok(invalidation)
    }

    async fn clear_layer(&self, layer: Layer, episodes: &[String]) -> Result<usize> {
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();

        for dir in self.layer_dirs(layer, episodes) {
            if !dir.exists() {
                continue;
            }
            let tombstone = tombstone_for(&dir, layer);
            if let Err(e) = fs::rename(&dir, &tombstone).await {
                for (original, stone) in moved.iter().rev() {
                    if let Err(restore) = fs::rename(stone, original).await {
                        warn!("Failed to restore {}: {}", original.display(), restore);
                    }
                }
                return Err(SubweaveError::Invalidation {
                    layer: layer.to_string(),
                    reason: format!("{}: {}", dir.display(), e),
                });
            }
            moved.push((dir, tombstone));
        }

        for (_, tombstone) in &moved {
            if let Err(e) = fs::remove_dir_all(tombstone).await {
                warn!("Tombstone {} left behind: {}", tombstone.display(), e);
            }
        }
        Ok(moved.len())
    }

    /// Remove tombstones left by an interrupted invalidation.
    pub async fn sweep_tombstones(&self, episodes: &[String]) -> Result<usize> {
        let mut parents: Vec<PathBuf> = episodes.iter().map(|id| self.root.join(id)).collect();
        parents.push(self.root.clone());

        let mut swept = 0;
        for parent in parents {
            let Ok(mut entries) = fs::read_dir(&parent).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(TOMBSTONE_PREFIX) {
                    fs::remove_dir_all(entry.path()).await?;
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            info!("Swept {} stale tombstones", swept);
        }
        Ok(swept)
    }
}

fn tombstone_for(dir: &Path, layer: Layer) -> PathBuf {
    let name = format!("{}{}-{}", TOMBSTONE_PREFIX, layer.name(), Uuid::new_v4().simple());
    dir.parent().map(|p| p.join(&name)).unwrap_or_else(|| PathBuf::from(name))
}

pub fn join_layers<'a, I: IntoIterator<Item = &'a Layer>>(layers: I) -> String {
    layers.into_iter().map(|l| l.name()).collect::<Vec<_>>().join(",")
}
