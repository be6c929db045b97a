//! Training driver (Component H): the EM loop over a fixed sample set.
//!
//! A [`Trainer`] holds the per-run machinery that does not belong in a
//! checkpoint (cached graphs, the discount adjuster's warm-start state);
//! [`TrainingContext`] holds everything that does (iteration number, model,
//! log-likelihood history, best model so far) and is what gets persisted.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accumulator::{accumulate, log_likelihood, AccumulatorKind};
use crate::config::{DiscountConfig, TrainingConfig};
use crate::discount::{DiscountAdjuster, FixedDiscounts, OptimizingDiscountAdjuster, StaticDiscounts};
use crate::error::{Error, PersistenceError, Result};
use crate::evidence::{compile, kneser_ney_discount, EvidenceStore};
use crate::graph::{Emergence, EstimationGraph};
use crate::minimization::has_significant_decrease;
use crate::model::Model;
use crate::multigram::{MultigramInventory, VOID as MULTIGRAM_VOID};
use crate::sequence_model::SequenceModel;
use crate::symbol::SymbolId;

const CONVERGENCE_WINDOW: usize = 10;

/// One training pair with its multiplicity in the sample set.
#[derive(Debug, Clone)]
pub struct Sample {
    pub left: Vec<SymbolId>,
    pub right: Vec<SymbolId>,
    pub weight: f64,
}

impl Sample {
    pub fn new(left: Vec<SymbolId>, right: Vec<SymbolId>) -> Self {
        Self { left, right, weight: 1.0 }
    }
}

/// A topology-only copy of `model`: identical history set (so `advance()`
/// produces identical state transitions and therefore identical `NodeId`s),
/// every score zeroed. Estimation graphs are built against this skeleton so
/// that evidence for a history the live model does not yet score directly
/// (a fresh rampUp node, say) is still harvested; `reweight` then substitutes
/// the live model's actual scores onto that fixed topology.
pub fn skeleton_for(model: &SequenceModel) -> SequenceModel {
    let mut skeleton = SequenceModel::new();
    skeleton.set_init_and_term(model.init(), model.term());
    let rows: Vec<_> = model.histories().map(|h| (h.clone(), MULTIGRAM_VOID, 0.0)).collect();
    skeleton.set(rows);
    skeleton
}

/// Persisted run state: everything [`Trainer::resume`] needs to re-enter
/// the loop. Cached graphs and the discount adjuster's warm-start state are
/// deliberately excluded: they are cheap to rebuild and derived entirely
/// from `model.discount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingContext {
    pub iteration: usize,
    pub model: Model,
    pub train_log_lik_history: Vec<f64>,
    pub devel_log_lik_history: Vec<f64>,
    pub best_model: Model,
    pub best_score: f64,
}

impl TrainingContext {
    pub fn new(model: Model) -> Self {
        Self {
            iteration: 0,
            best_model: model.clone(),
            best_score: f64::NEG_INFINITY,
            model,
            train_log_lik_history: Vec::new(),
            devel_log_lik_history: Vec::new(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = bincode::serialize(self).map_err(PersistenceError::from)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(PersistenceError::from)?;
        std::fs::rename(&tmp, path).map_err(PersistenceError::from)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(PersistenceError::from)?;
        let mut ctx: Self = bincode::deserialize(&bytes).map_err(PersistenceError::from)?;
        ctx.model.sequence_model.rebuild_index();
        ctx.best_model.sequence_model.rebuild_index();
        Ok(ctx)
    }
}

fn make_adjuster(cfg: &DiscountConfig, initial: Option<Vec<f64>>) -> Box<dyn DiscountAdjuster> {
    match cfg {
        DiscountConfig::Fixed(d) => Box::new(FixedDiscounts::new(d.clone())),
        DiscountConfig::Static => Box::new(StaticDiscounts::new(initial.unwrap_or_else(|| vec![0.0]))),
        DiscountConfig::Optimizing { eager } => Box::new(OptimizingDiscountAdjuster::new(*eager, initial)),
    }
}

struct CachedGraph {
    graph: EstimationGraph,
    skeleton_size: usize,
}

/// Get this sample's graph against `skeleton`, rebuilding it if the
/// skeleton has grown since it was last built, caching the result when the
/// sample set is small enough to keep in memory (`scratch` holds a one-off
/// build when it isn't).
#[allow(clippy::too_many_arguments)]
fn graph_for<'a>(
    slot: &'a mut Option<CachedGraph>,
    cache: bool,
    sample: &Sample,
    skeleton: &SequenceModel,
    templates: &[(usize, usize)],
    emergence: Emergence,
    term: u32,
    multigrams: &mut MultigramInventory,
    scratch: &'a mut Option<EstimationGraph>,
) -> Result<&'a mut EstimationGraph> {
    let needs_rebuild = match slot {
        Some(cached) => cached.skeleton_size != skeleton.num_nodes(),
        None => true,
    };
    if needs_rebuild {
        let graph = EstimationGraph::build(
            &sample.left,
            &sample.right,
            templates,
            emergence,
            term,
            multigrams,
            skeleton,
        )?;
        if cache {
            *slot = Some(CachedGraph { graph, skeleton_size: skeleton.num_nodes() });
        } else {
            *scratch = Some(graph);
            return Ok(scratch.as_mut().unwrap());
        }
    }
    Ok(&mut slot.as_mut().unwrap().graph)
}

/// Per-sample graph cache plus the discount adjuster: the machinery a
/// checkpoint does not carry and [`Trainer::resume`] rebuilds from scratch.
pub struct Trainer {
    config: TrainingConfig,
    adjuster: Box<dyn DiscountAdjuster>,
    cache_graphs: bool,
    train_graphs: Vec<Option<CachedGraph>>,
    devel_graphs: Vec<Option<CachedGraph>>,
    last_checkpoint: Instant,
}

impl Trainer {
    pub fn new(config: TrainingConfig, train_len: usize, devel_len: usize) -> Result<Self> {
        config.validate()?;
        let cache_graphs = train_len + devel_len <= config.max_stored_graphs;
        let adjuster = make_adjuster(&config.discount, None);
        Ok(Self {
            config,
            adjuster,
            cache_graphs,
            train_graphs: (0..train_len).map(|_| None).collect(),
            devel_graphs: (0..devel_len).map(|_| None).collect(),
            last_checkpoint: Instant::now(),
        })
    }

    /// Resume after a checkpoint: the discount adjuster is reconstructed
    /// with `ctx.model.discount` as its warm-start point.
    pub fn resume(config: TrainingConfig, ctx: &TrainingContext, train_len: usize, devel_len: usize) -> Result<Self> {
        config.validate()?;
        let cache_graphs = train_len + devel_len <= config.max_stored_graphs;
        let initial = if ctx.model.discount.is_empty() { None } else { Some(ctx.model.discount.clone()) };
        let adjuster = make_adjuster(&config.discount, initial);
        Ok(Self {
            config,
            adjuster,
            cache_graphs,
            train_graphs: (0..train_len).map(|_| None).collect(),
            devel_graphs: (0..devel_len).map(|_| None).collect(),
            last_checkpoint: Instant::now(),
        })
    }

    /// Run one EM iteration, mutating `ctx` in place. Returns the train
    /// log-likelihood recorded this iteration.
    pub fn iterate(&mut self, ctx: &mut TrainingContext, train: &[Sample], devel: &[Sample]) -> Result<f64> {
        let templates = self.config.size_constraints.templates();
        let term = ctx.model.sequitur.term;
        let emergence = self.config.emergence;
        let accumulator_kind = if self.config.use_viterbi { AccumulatorKind::Viterbi } else { AccumulatorKind::Sum };

        if self.config.ramp_up && ctx.iteration == 0 {
            ctx.model.ramp_up();
        }
        if self.config.wipe_out && ctx.iteration == 0 {
            ctx.model.wipe_out(&templates);
        }
        let vocabulary_size = ctx.model.sequitur.vocabulary_size(&templates);

        let skeleton = skeleton_for(&ctx.model.sequence_model);

        let mut evidence = EvidenceStore::new();
        let mut train_log_lik = 0.0;
        let mut scratch = None;
        for (idx, sample) in train.iter().enumerate() {
            let graph = match graph_for(
                &mut self.train_graphs[idx],
                self.cache_graphs,
                sample,
                &skeleton,
                &templates,
                emergence,
                term,
                &mut ctx.model.sequitur.inventory,
                &mut scratch,
            ) {
                Ok(g) => g,
                Err(Error::SampleUnreachable(msg)) => {
                    warn!(sample = idx, reason = %msg, "dropping unreachable sample");
                    continue;
                }
                Err(e) => return Err(e),
            };
            graph.reweight(&ctx.model.sequence_model);
            train_log_lik +=
                accumulate(graph, &ctx.model.sequence_model, accumulator_kind, sample.weight, &mut evidence);
        }
        ctx.train_log_lik_history.push(train_log_lik);

        let last_devel = ctx.devel_log_lik_history.last().copied();
        let use_devel = !devel.is_empty();
        let evidence_maximum = evidence.consolidate().iter().map(|&(_, _, v)| v).fold(0.0, f64::max);
        let order = ctx.model.sequence_model.max_order();

        // Pre-build (or refresh the topology of) the adjudication graphs
        // before the discount search starts, so the scoring closure below
        // only ever reads the cache. discount.rs's `score` parameter is a
        // plain `Fn`, not `FnMut`, and the minimisers it feeds call it many
        // times per iteration.
        if use_devel {
            let mut scratch = None;
            for (idx, sample) in devel.iter().enumerate() {
                if let Err(Error::SampleUnreachable(msg)) = graph_for(
                    &mut self.devel_graphs[idx],
                    self.cache_graphs,
                    sample,
                    &skeleton,
                    &templates,
                    Emergence::Anonymize,
                    term,
                    &mut ctx.model.sequitur.inventory,
                    &mut scratch,
                ) {
                    warn!(sample = idx, reason = %msg, "held-out sample unreachable, excluded from adjudication");
                }
            }
        }

        let adjudication_graphs: &[Option<CachedGraph>] =
            if use_devel { &self.devel_graphs } else { &self.train_graphs };
        let score = |candidate: &[f64]| -> f64 {
            let levels = kneser_ney_discount(&evidence, candidate);
            let candidate_model = compile(&levels, vocabulary_size);
            let mut total = 0.0;
            for cached in adjudication_graphs.iter().flatten() {
                let mut g = cached.graph.clone();
                total += log_likelihood(&mut g, &candidate_model);
            }
            total
        };
        let discount = self.adjuster.adjust(order, evidence_maximum, last_devel, &score)?;

        let levels = kneser_ney_discount(&evidence, &discount);
        ctx.model.sequence_model = compile(&levels, vocabulary_size);
        ctx.model.discount = discount;

        if use_devel {
            let mut devel_ll = 0.0;
            let mut scratch = None;
            for (idx, sample) in devel.iter().enumerate() {
                let graph = match graph_for(
                    &mut self.devel_graphs[idx],
                    self.cache_graphs,
                    sample,
                    &skeleton,
                    &templates,
                    Emergence::Anonymize,
                    term,
                    &mut ctx.model.sequitur.inventory,
                    &mut scratch,
                ) {
                    Ok(g) => g,
                    Err(Error::SampleUnreachable(msg)) => {
                        warn!(sample = idx, reason = %msg, "dropping unreachable held-out sample");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                devel_ll += sample.weight * log_likelihood(graph, &ctx.model.sequence_model);
            }
            ctx.devel_log_lik_history.push(devel_ll);
        }

        let adjudication_score = ctx.devel_log_lik_history.last().copied().unwrap_or(train_log_lik);
        if ctx.iteration + 1 >= self.config.min_iterations && adjudication_score > ctx.best_score {
            ctx.best_score = adjudication_score;
            ctx.best_model = ctx.model.clone();
        }

        info!(
            iteration = ctx.iteration,
            train_log_lik,
            devel_log_lik = ctx.devel_log_lik_history.last().copied(),
            "completed EM iteration"
        );
        ctx.iteration += 1;
        Ok(train_log_lik)
    }

    fn converged(&self, ctx: &TrainingContext) -> bool {
        if ctx.iteration < self.config.min_iterations {
            return false;
        }
        let series: Vec<f64> = if ctx.devel_log_lik_history.is_empty() {
            ctx.train_log_lik_history.iter().map(|&v| -v).collect()
        } else {
            ctx.devel_log_lik_history.iter().map(|&v| -v).collect()
        };
        if series.len() < CONVERGENCE_WINDOW {
            return false;
        }
        let window = &series[series.len() - CONVERGENCE_WINDOW..];
        !has_significant_decrease(window)
    }

    /// Run the full loop: iterate until convergence, `maxIterations`, or
    /// cancellation, checkpointing along the way. `cancelled` is polled
    /// between iterations; `observer` runs after every iteration (periodic
    /// external evaluation); `checkpoint_path`, when given together with a
    /// configured interval, receives the training context every
    /// `checkpoint_interval_secs` of wall-clock time.
    pub fn run(
        &mut self,
        ctx: &mut TrainingContext,
        train: &[Sample],
        devel: &[Sample],
        mut cancelled: impl FnMut() -> bool,
        mut observer: Option<&mut dyn FnMut(&TrainingContext)>,
        checkpoint_path: Option<&Path>,
    ) -> Result<()> {
        while ctx.iteration < self.config.max_iterations {
            if cancelled() {
                info!(iteration = ctx.iteration, "training cancelled, publishing best model");
                break;
            }
            self.iterate(ctx, train, devel)?;
            if let Some(obs) = observer.as_deref_mut() {
                obs(ctx);
            }
            if let (Some(path), Some(interval)) = (checkpoint_path, self.config.checkpoint_interval_secs) {
                if self.last_checkpoint.elapsed().as_secs() >= interval {
                    ctx.save(path)?;
                    self.last_checkpoint = Instant::now();
                }
            }
            if self.converged(ctx) {
                info!(iteration = ctx.iteration, "converged");
                break;
            }
        }
        Ok(())
    }
}
