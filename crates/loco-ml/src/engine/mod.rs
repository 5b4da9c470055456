//! Chunked separation engine
//!
//! Owns the device probe and weight store, and once initialized for a tier,
//! an immutable [`TfLocoformer`] shared read-only by concurrent calls.
//! Long inputs are cut into overlapping chunks that run in parallel
//! batches and are crossfaded back together in chunk order.

mod chunking;
mod postprocess;
mod result;

pub use chunking::ChunkPlan;
pub use postprocess::{BASS_MONO_HZ, VOCAL_HIGHPASS_HZ, condition};
pub use result::{
    EngineMetadata, ExecutionMode, OutputFormat, SeparationOptions, SeparationResult, StemCollection, StemOutput,
    StereoMode,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use loco_dsp::Stft;
use loco_dsp::filters::{deinterleave, downmix, interleave, limit_peak, quantize_pcm16, soft_limit};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::config::{EngineConfig, ModelConfig, StemKind, Tier};
use crate::device::{Device, DeviceProbe, SystemProbe, select_device};
use crate::error::{MlError, MlResult};
use crate::model::TfLocoformer;
use crate::weights::{LoadedWeights, WeightKey, WeightQuality, WeightStore};

/// Peak ceiling for `normalize` and the enhance limiter
pub const PEAK_CEILING: f32 = 0.95;

/// Cooperative cancellation flag, cheap to clone across threads
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Chunks merged so far, across all separated channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub done: usize,
    pub total: usize,
}

impl ChunkProgress {
    /// Progress (0.0 - 1.0)
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.done as f64 / self.total as f64
    }
}

/// Lifecycle as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready { tier: Tier },
    Failed(String),
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineStatus::Ready { .. })
    }
}

/// Everything `separate` needs, built once by `initialize`
struct ReadyModel {
    tier: Tier,
    model_config: ModelConfig,
    model: TfLocoformer,
    stft: Stft,
    weights: LoadedWeights,
    device: Device,
}

enum EngineState {
    Uninitialized,
    Initializing,
    Ready(Arc<ReadyModel>),
    Failed(String),
}

pub struct SeparationEngine {
    config: EngineConfig,
    probe: Box<dyn DeviceProbe>,
    store: WeightStore,
    state: RwLock<EngineState>,
}

impl SeparationEngine {
    /// Engine probing the host for devices
    pub fn new(config: EngineConfig) -> MlResult<Self> {
        Self::with_probe(config, Box::new(SystemProbe))
    }

    pub fn with_probe(config: EngineConfig, probe: Box<dyn DeviceProbe>) -> MlResult<Self> {
        config.validate()?;
        let store = WeightStore::new(config.weights_dir.clone(), config.cache_capacity);
        Ok(Self {
            config,
            probe,
            store,
            state: RwLock::new(EngineState::Uninitialized),
        })
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn weight_store(&self) -> &WeightStore {
        &self.store
    }

    /// Select a device, load weights and build the model for `tier`.
    ///
    /// Re-initializing replaces the ready model; a failure leaves the engine
    /// in [`EngineStatus::Failed`].
    pub fn initialize(&self, tier: Tier) -> MlResult<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, EngineState::Initializing) {
                return Err(MlError::NotReady("initialization already in progress".into()));
            }
            *state = EngineState::Initializing;
        }

        log::info!("Initializing separation engine for {tier} tier");
        match self.build(tier) {
            Ok(ready) => {
                log::info!(
                    "Engine ready: {} on {}, weights {} ({})",
                    ready.weights.key,
                    ready.device,
                    ready.weights.short_hash(),
                    if ready.weights.degraded.is_some() { "placeholder" } else { "trained" }
                );
                *self.state.write() = EngineState::Ready(Arc::new(ready));
                Ok(())
            }
            Err(e) => {
                log::error!("Engine initialization failed: {e}");
                *self.state.write() = EngineState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn build(&self, tier: Tier) -> MlResult<ReadyModel> {
        let device = select_device(self.probe.as_ref(), tier)?;

        let model_config = self.config.model_config(tier);
        let key = WeightKey::new(tier.variant(), self.config.weights_version.clone());
        let weights = if self.config.allow_placeholder_weights {
            self.store.load_or_placeholder(&key, &model_config)
        } else {
            self.store.load(&key, &model_config)?
        };

        let mut model = TfLocoformer::new(model_config.clone())?;
        model.load_weights(&weights.weights)?;
        let stft = Stft::new(self.config.transform.clone())?;

        Ok(ReadyModel {
            tier,
            model_config,
            model,
            stft,
            weights,
            device,
        })
    }

    pub fn state(&self) -> EngineStatus {
        match &*self.state.read() {
            EngineState::Uninitialized => EngineStatus::Uninitialized,
            EngineState::Initializing => EngineStatus::Initializing,
            EngineState::Ready(ready) => EngineStatus::Ready { tier: ready.tier },
            EngineState::Failed(msg) => EngineStatus::Failed(msg.clone()),
        }
    }

    /// Model configuration of the initialized tier
    pub fn config(&self) -> MlResult<ModelConfig> {
        Ok(self.ready()?.model_config.clone())
    }

    pub fn device(&self) -> Option<Device> {
        self.ready().ok().map(|r| r.device.clone())
    }

    pub fn weight_quality(&self) -> Option<WeightQuality> {
        self.ready().ok().map(|r| r.weights.quality())
    }

    fn ready(&self) -> MlResult<Arc<ReadyModel>> {
        match &*self.state.read() {
            EngineState::Ready(ready) => Ok(Arc::clone(ready)),
            EngineState::Uninitialized => Err(MlError::NotReady("engine not initialized".into())),
            EngineState::Initializing => Err(MlError::NotReady("engine is initializing".into())),
            EngineState::Failed(msg) => Err(MlError::NotReady(format!("initialization failed: {msg}"))),
        }
    }

    pub fn separate(&self, pcm: &[f32], opts: &SeparationOptions) -> MlResult<SeparationResult> {
        self.separate_with_cancel(pcm, opts, &CancelToken::new())
    }

    pub fn separate_with_cancel(
        &self,
        pcm: &[f32],
        opts: &SeparationOptions,
        cancel: &CancelToken,
    ) -> MlResult<SeparationResult> {
        self.separate_with_progress(pcm, opts, cancel, &|_| {})
    }

    /// Like [`separate_with_cancel`](Self::separate_with_cancel), calling
    /// `on_chunk` on the caller's thread after each chunk is merged. The
    /// token is checked before every batch, so cancelling from `on_chunk`
    /// stops at the next chunk boundary.
    pub fn separate_with_progress(
        &self,
        pcm: &[f32],
        opts: &SeparationOptions,
        cancel: &CancelToken,
        on_chunk: &dyn Fn(ChunkProgress),
    ) -> MlResult<SeparationResult> {
        let ready = self.ready()?;
        validate_input(pcm, opts, ready.tier)?;

        let start = Instant::now();
        let frames = pcm.len() / opts.channels;
        let plan = ChunkPlan::new(
            frames,
            opts.sample_rate,
            self.config.chunk_seconds,
            self.config.overlap_seconds,
        )?;
        log::debug!(
            "Separating {frames} frames x {} channels in {} chunks (chunk {}, overlap {})",
            opts.channels,
            plan.len(),
            plan.chunk,
            plan.overlap
        );

        let planes = match (opts.channels, opts.stereo_mode) {
            (1, _) => vec![pcm.to_vec()],
            (_, StereoMode::Downmix) => vec![downmix(pcm, opts.channels)?],
            (_, StereoMode::PerChannel) => deinterleave(pcm, opts.channels)?,
        };

        let mut progress = ChunkProgress {
            done: 0,
            total: plan.len() * planes.len(),
        };

        // separated[plane][stem]
        let separated = planes
            .iter()
            .map(|plane| self.separate_plane(&ready, plane, &plan, cancel, &mut progress, on_chunk))
            .collect::<MlResult<Vec<_>>>()?;

        let stem_kinds = &ready.model_config.stem_names;
        let mut stems = StemCollection::new();
        for (s, &kind) in stem_kinds.iter().enumerate() {
            let mut audio = match separated.as_slice() {
                [mono] if opts.channels == 1 => mono[s].clone(),
                [mono] => interleave(&vec![mono[s].clone(); opts.channels]),
                per_channel => {
                    let channels: Vec<Vec<f32>> = per_channel.iter().map(|p| p[s].clone()).collect();
                    interleave(&channels)
                }
            };

            condition(kind, &mut audio, opts.channels, opts.sample_rate)?;
            if opts.normalize {
                let gain = limit_peak(&mut audio, PEAK_CEILING);
                if gain < 1.0 {
                    log::debug!("Stem {kind} scaled by {gain:.3} to peak {PEAK_CEILING}");
                }
            }
            if opts.output_format == OutputFormat::Pcm16 {
                quantize_pcm16(&mut audio);
            }
            stems.add(StemOutput::new(kind, audio, opts.channels, opts.sample_rate));
        }

        let execution_mode = if self.config.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };
        let metadata = opts.debug.then(|| EngineMetadata {
            variant: ready.weights.key.variant,
            version: ready.weights.key.version.clone(),
            weight_hash: ready.weights.hash.clone(),
            chunk_size: plan.chunk,
            overlap_size: plan.overlap,
            hop_size: plan.hop,
            chunk_count: plan.len(),
            execution_mode,
            stems: stem_kinds.clone(),
        });

        let processing_time_ms = start.elapsed().as_millis() as u64;
        let duration_secs = frames as f64 / opts.sample_rate as f64;
        log::info!(
            "Separated {duration_secs:.2}s of audio into {} stems in {processing_time_ms} ms",
            stems.len()
        );

        Ok(SeparationResult {
            stems,
            sample_rate: opts.sample_rate,
            channels: opts.channels,
            duration_secs,
            processing_time_ms,
            device: ready.device.name.clone(),
            weight_quality: ready.weights.quality(),
            metadata,
        })
    }

    /// Separate one mono signal; returns one full-length buffer per stem
    fn separate_plane(
        &self,
        ready: &ReadyModel,
        signal: &[f32],
        plan: &ChunkPlan,
        cancel: &CancelToken,
        progress: &mut ChunkProgress,
        on_chunk: &dyn Fn(ChunkProgress),
    ) -> MlResult<Vec<Vec<f32>>> {
        let mut outputs = vec![vec![0.0f32; signal.len()]; ready.model_config.num_stems];
        let batch_size = self.config.chunk_batch_size();
        let indices: Vec<usize> = (0..plan.len()).collect();

        for batch in indices.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(MlError::Cancelled);
            }

            let results: Vec<MlResult<Vec<Vec<f32>>>> = if self.config.parallel {
                batch
                    .par_iter()
                    .map(|&i| process_chunk(ready, signal, plan, i, cancel))
                    .collect()
            } else {
                batch
                    .iter()
                    .map(|&i| process_chunk(ready, signal, plan, i, cancel))
                    .collect()
            };

            // Merge in chunk order
            for (&i, result) in batch.iter().zip(results) {
                let chunk_stems = result?;
                let start = plan.starts()[i];
                let valid = plan.valid_len(i);
                for (out, stem) in outputs.iter_mut().zip(&chunk_stems) {
                    for (o, &s) in out[start..start + valid].iter_mut().zip(&stem[..valid]) {
                        *o += s;
                    }
                }
                progress.done += 1;
                on_chunk(*progress);
            }
        }

        Ok(outputs)
    }

    /// Main output for speech cleanup: vocals, else instrumental
    pub fn clean(&self, pcm: &[f32], opts: &SeparationOptions) -> MlResult<Vec<f32>> {
        let mut result = self.separate(pcm, opts)?;
        result
            .stems
            .take(StemKind::Vocals)
            .or_else(|| result.stems.take(StemKind::Instrumental))
            .map(|stem| stem.audio)
            .ok_or_else(|| MlError::MissingStem("vocals or instrumental".into()))
    }

    /// Rebalanced remix of all stems through a soft limiter
    pub fn enhance(&self, pcm: &[f32], opts: &SeparationOptions) -> MlResult<Vec<f32>> {
        let result = self.separate(pcm, opts)?;
        let mut mix = result
            .stems
            .remix(&enhance_gains())
            .ok_or_else(|| MlError::MissingStem("no stems to remix".into()))?;

        soft_limit(&mut mix, PEAK_CEILING);
        if opts.output_format == OutputFormat::Pcm16 {
            quantize_pcm16(&mut mix);
        }
        Ok(mix)
    }
}

fn enhance_gains() -> BTreeMap<StemKind, f32> {
    [
        StemKind::Vocals,
        StemKind::Instrumental,
        StemKind::Drums,
        StemKind::Bass,
        StemKind::Instruments,
        StemKind::Fx,
    ]
    .into_iter()
    .map(|kind| {
        let gain = match kind {
            StemKind::Vocals => 1.0,
            StemKind::Instruments | StemKind::Instrumental => 0.95,
            StemKind::Drums => 0.9,
            StemKind::Bass => 0.85,
            StemKind::Fx => 0.7,
        };
        (kind, gain)
    })
    .collect()
}

fn validate_input(pcm: &[f32], opts: &SeparationOptions, tier: Tier) -> MlResult<()> {
    if pcm.is_empty() {
        return Err(MlError::InvalidInput("empty audio buffer".into()));
    }
    if !matches!(opts.channels, 1 | 2) {
        return Err(MlError::InvalidInput(format!(
            "{} channels (expected 1 or 2)",
            opts.channels
        )));
    }
    if pcm.len() % opts.channels != 0 {
        return Err(MlError::InvalidInput(format!(
            "{} samples is not a whole number of {}-channel frames",
            pcm.len(),
            opts.channels
        )));
    }
    if opts.sample_rate == 0 {
        return Err(MlError::InvalidInput("sample rate must be positive".into()));
    }
    if opts.tier != tier {
        return Err(MlError::TierMismatch {
            initialized: tier.to_string(),
            requested: opts.tier.to_string(),
        });
    }
    Ok(())
}

/// STFT → model → iSTFT → crossfade window, for chunk `index`
fn process_chunk(
    ready: &ReadyModel,
    signal: &[f32],
    plan: &ChunkPlan,
    index: usize,
    cancel: &CancelToken,
) -> MlResult<Vec<Vec<f32>>> {
    if cancel.is_cancelled() {
        return Err(MlError::Cancelled);
    }

    let chunk = plan.extract(signal, index);
    let spec = ready.stft.forward(&chunk)?;
    let stem_specs = ready.model.separate(&spec)?;
    let window = plan.window(index);

    let stems = stem_specs
        .iter()
        .map(|stem| -> MlResult<Vec<f32>> {
            let mut audio = ready.stft.inverse(stem, plan.chunk)?;
            for (s, &w) in audio.iter_mut().zip(&window) {
                *s *= w;
            }
            Ok(audio)
        })
        .collect::<MlResult<Vec<_>>>()?;

    log::debug!("Chunk {}/{} done ({} frames)", index + 1, plan.len(), spec.num_frames());
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_validate_input() {
        let opts = SeparationOptions::new(Tier::Free, 8000, 2);
        assert!(validate_input(&[0.0; 4], &opts, Tier::Free).is_ok());
        assert!(matches!(
            validate_input(&[], &opts, Tier::Free),
            Err(MlError::InvalidInput(_))
        ));
        assert!(validate_input(&[0.0; 3], &opts, Tier::Free).is_err());
        assert!(matches!(
            validate_input(&[0.0; 4], &opts, Tier::Pro),
            Err(MlError::TierMismatch { .. })
        ));

        let surround = SeparationOptions::new(Tier::Free, 8000, 6);
        assert!(validate_input(&[0.0; 12], &surround, Tier::Free).is_err());
        let no_rate = SeparationOptions::new(Tier::Free, 0, 1);
        assert!(validate_input(&[0.0; 4], &no_rate, Tier::Free).is_err());
    }

    #[test]
    fn test_enhance_gains() {
        let gains = enhance_gains();
        assert_eq!(gains.len(), 6);
        assert_eq!(gains[&StemKind::Vocals], 1.0);
        assert_eq!(gains[&StemKind::Fx], 0.7);
        assert_eq!(gains[&StemKind::Bass], 0.85);
    }

    #[test]
    fn test_uninitialized_engine() {
        let engine = SeparationEngine::with_probe(EngineConfig::default(), Box::new(crate::device::CpuOnlyProbe)).unwrap();
        assert_eq!(engine.state(), EngineStatus::Uninitialized);
        assert!(matches!(engine.config(), Err(MlError::NotReady(_))));
        assert!(engine.device().is_none());
        assert!(matches!(
            engine.separate(&[0.0; 8], &SeparationOptions::default()),
            Err(MlError::NotReady(_))
        ));
    }
}
