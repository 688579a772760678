//! Playback operator: the pool of sources, the plane mixers and the
//! mapping from controller slots to what is on air.
//!
//! Everything here runs on the render thread. Sources are allocated on
//! `show_media`, faded in on the output their slot maps to, and closed
//! exactly once when no mixer references them anymore.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use common::{ControllerState, MEDIA_BUTTONS, MixerStatus, PoolEntryStatus};

use crate::config::{Config, PoolSettings};
use crate::controller::StateReporter;
use crate::error::{RenderError, ShowMediaError};
use crate::gpu::{Compositor, GpuBackend};
use crate::media::{MediaSource, SourceDescriptor, SourceFactory, SourceKind, SourceSettings};
use crate::plane_mixer::PlaneMixer;
use crate::transition::EasingFunction;

/// Everything the operator needs from the configuration
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub outputs: usize,
    pub grid_columns: u32,
    pub fade_duration: Duration,
    pub fade_curve: EasingFunction,
    pub pool: PoolSettings,
    pub source: SourceSettings,
    /// Resolved media per slot id
    pub slots: BTreeMap<u32, SourceDescriptor>,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            outputs: 2,
            grid_columns: 8,
            fade_duration: Duration::from_secs(2),
            fade_curve: EasingFunction::Linear,
            pool: PoolSettings::default(),
            source: SourceSettings::default(),
            slots: BTreeMap::new(),
        }
    }
}

impl OperatorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for slot in &config.slot {
            match config.descriptor(slot.id) {
                Some(descriptor) => {
                    slots.insert(slot.id, descriptor);
                }
                None => anyhow::bail!("Slot {} cannot be resolved", slot.id),
            }
        }

        Ok(Self {
            outputs: config.general.outputs.max(1),
            grid_columns: config.general.grid_columns.max(1),
            fade_duration: Duration::from_millis(config.general.fade_time_ms),
            fade_curve: config.fade_curve()?,
            pool: config.pool.clone(),
            source: SourceSettings {
                queue_capacity: config.pool.queue_capacity,
                fence_timeout: Duration::from_millis(config.advanced.fence_timeout_ms),
                stats_interval: Duration::from_secs(config.advanced.stats_interval_secs),
            },
            slots,
        })
    }
}

struct PoolEntry<B: GpuBackend> {
    source: MediaSource<B>,
    /// Slot this entry was allocated for
    media_slot: Option<u32>,
}

pub struct PlaybackOperator<B: GpuBackend> {
    settings: OperatorSettings,
    backend: B,
    factory: Box<dyn SourceFactory>,
    reporter: Box<dyn StateReporter>,
    pool: Vec<PoolEntry<B>>,
    /// Slot id -> pool index of the entry showing it
    bindings: BTreeMap<u32, usize>,
    mixers: Vec<PlaneMixer>,
    bank: u8,
    started: Instant,
}

impl<B: GpuBackend> PlaybackOperator<B> {
    pub fn new(
        settings: OperatorSettings,
        backend: B,
        factory: Box<dyn SourceFactory>,
        reporter: Box<dyn StateReporter>,
    ) -> Self {
        Self {
            settings,
            backend,
            factory,
            reporter,
            pool: Vec::new(),
            bindings: BTreeMap::new(),
            mixers: Vec::new(),
            bank: 0,
            started: Instant::now(),
        }
    }

    /// Build the source pool and one mixer per output, closing whatever
    /// was there before
    pub fn initialize(&mut self) {
        for entry in &mut self.pool {
            entry.source.shutdown(&mut self.backend);
        }
        self.pool.clear();
        self.bindings.clear();

        for kind in SourceKind::ALL {
            for _ in 0..self.settings.pool.count(kind) {
                let index = self.pool.len();
                self.pool.push(PoolEntry {
                    source: MediaSource::new(kind, index, self.settings.source.clone()),
                    media_slot: None,
                });
            }
        }

        self.mixers = (0..self.settings.outputs)
            .map(|_| PlaneMixer::new(self.settings.fade_duration))
            .collect();

        log::info!(
            "Operator initialized: {} outputs, {} pooled sources ({} video, {} capture, {} procedural), {} slots",
            self.mixers.len(),
            self.pool.len(),
            self.settings.pool.video,
            self.settings.pool.capture,
            self.settings.pool.procedural,
            self.settings.slots.len()
        );

        self.report_state();
    }

    /// Output a slot is shown on
    pub fn output_for(&self, slot: u32) -> usize {
        let outputs = self.mixers.len().max(1);
        (slot / self.settings.grid_columns.max(1)) as usize % outputs
    }

    /// Allocate a source for `slot` and fade it in on its output.
    /// Returns the pool index now showing it.
    pub fn show_media(&mut self, slot: u32) -> Result<usize, ShowMediaError> {
        let descriptor = self
            .settings
            .slots
            .get(&slot)
            .cloned()
            .ok_or(ShowMediaError::UnknownSlot(slot))?;

        let output = self.output_for(slot);
        let Some(mixer) = self.mixers.get(output) else {
            return Err(ShowMediaError::NoFreeSource(descriptor.kind.to_string()));
        };
        if mixer.is_fading() {
            log::debug!("Slot {} ignored: output {} is fading", slot, output);
            return Err(ShowMediaError::MixerBusy(output));
        }
        if let Some(&index) = self.bindings.get(&slot)
            && mixer.visible_id() == Some(index)
        {
            return Err(ShowMediaError::AlreadyShowing(slot));
        }

        let index = self
            .find_free(descriptor.kind)
            .ok_or_else(|| ShowMediaError::NoFreeSource(descriptor.kind.to_string()))?;

        let entry = &mut self.pool[index];
        let started = entry
            .source
            .open(&descriptor, self.factory.as_ref())
            .and_then(|()| entry.source.play());
        if let Err(e) = started {
            entry.source.close(&mut self.backend);
            entry.media_slot = None;
            return Err(e.into());
        }
        entry.media_slot = Some(slot);

        self.bindings.insert(slot, index);
        self.mixers[output].start_fade(Some(index));
        log::info!(
            "Slot {} ({}) fading in on output {} from source {}",
            slot,
            descriptor.label(),
            output,
            self.pool[index].source.label()
        );

        self.report_state();
        Ok(index)
    }

    fn find_free(&self, kind: SourceKind) -> Option<usize> {
        let referenced = self.referenced();
        self.pool.iter().enumerate().position(|(i, entry)| {
            entry.source.kind() == kind && !referenced.contains(&i) && entry.source.is_closed()
        })
    }

    fn referenced(&self) -> BTreeSet<usize> {
        self.mixers.iter().flat_map(|m| m.active_ids()).collect()
    }

    /// One render cycle of bookkeeping, before any output is drawn
    pub fn update(&mut self, dt: Duration) {
        let now = Instant::now();

        for (output, mixer) in self.mixers.iter_mut().enumerate() {
            if let Some(released) = mixer.update(dt) {
                log::debug!("Output {} released source {}", output, released);
            }
        }

        for entry in &mut self.pool {
            entry.source.update(&mut self.backend, now);
        }

        for index in 0..self.pool.len() {
            if !self.pool[index].source.take_ended() {
                continue;
            }
            for (output, mixer) in self.mixers.iter_mut().enumerate() {
                if !mixer.references(index) {
                    continue;
                }
                if !mixer.is_fading() && mixer.visible_id() == Some(index) {
                    log::info!("Output {}: source {} ended, fading to black", output, index);
                    mixer.start_fade(None);
                } else {
                    log::info!("Output {}: source {} ended mid-fade, detaching", output, index);
                    mixer.detach(index);
                }
            }
        }

        let referenced = self.referenced();
        for (index, entry) in self.pool.iter_mut().enumerate() {
            if referenced.contains(&index) {
                continue;
            }
            if !entry.source.is_closed() {
                entry.source.close(&mut self.backend);
            }
            entry.media_slot = None;
        }
        self.bindings.retain(|_, index| referenced.contains(index));

        self.report_state();
    }

    /// Draw one output through `compositor`, then fence every image it drew
    pub fn render_plane(
        &mut self,
        output: usize,
        compositor: &mut dyn Compositor<B::Image>,
    ) -> Result<(), RenderError> {
        let mixer = self
            .mixers
            .get(output)
            .ok_or(RenderError::NoSuchOutput(output))?;
        let mix = self.settings.fade_curve.apply(mixer.mix_value());

        let image = |id: Option<usize>| {
            id.and_then(|i| self.pool.get(i))
                .and_then(|entry| entry.source.current_texture())
        };
        let from = image(mixer.from_id());
        let to = image(mixer.to_id());
        compositor.composite(output, from, to, mix)?;

        let drawn: Vec<usize> = [
            mixer.from_id().filter(|_| from.is_some()),
            mixer.to_id().filter(|_| to.is_some()),
        ]
        .into_iter()
        .flatten()
        .collect();
        for index in drawn {
            let fence = self.backend.create_fence();
            self.pool[index].source.arm_fence(&mut self.backend, fence);
        }
        Ok(())
    }

    pub fn set_bank(&mut self, bank: u8) {
        if self.bank != bank {
            log::info!("Controller bank {} -> {}", self.bank, bank);
            self.bank = bank;
            self.report_state();
        }
    }

    pub fn bank(&self) -> u8 {
        self.bank
    }

    /// Change looping for a slot, including the source playing it
    pub fn set_looping(&mut self, slot: u32, looping: bool) -> Result<(), ShowMediaError> {
        let descriptor = self
            .settings
            .slots
            .get_mut(&slot)
            .ok_or(ShowMediaError::UnknownSlot(slot))?;
        descriptor.looping = looping;

        if let Some(&index) = self.bindings.get(&slot) {
            self.pool[index].source.set_looping(looping);
        }
        log::info!("Slot {} looping {}", slot, if looping { "on" } else { "off" });
        Ok(())
    }

    pub fn set_fade_duration(&mut self, duration: Duration) {
        self.settings.fade_duration = duration;
        for mixer in &mut self.mixers {
            mixer.set_fade_duration(duration);
        }
        log::info!("Fade duration set to {:?}", duration);
    }

    /// Indicator state of the current bank's buttons
    pub fn controller_state(&self) -> ControllerState {
        let referenced = self.referenced();
        let mut state = ControllerState {
            bank: self.bank,
            ..ControllerState::default()
        };

        for (button, indicator) in state.media.iter_mut().enumerate() {
            let slot = u32::from(self.bank) * MEDIA_BUTTONS as u32 + button as u32;
            let Some(descriptor) = self.settings.slots.get(&slot) else {
                continue;
            };
            let on_air = self
                .bindings
                .get(&slot)
                .is_some_and(|index| referenced.contains(index));
            let base = descriptor.kind.slot_state();
            *indicator = if on_air { base.activated() } else { base };
        }
        state
    }

    fn report_state(&mut self) {
        let state = self.controller_state();
        self.reporter.report(&state);
    }

    pub fn status(&self) -> MixerStatus {
        MixerStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            outputs: self
                .mixers
                .iter()
                .enumerate()
                .map(|(i, m)| m.status(i))
                .collect(),
            pool: self
                .pool
                .iter()
                .enumerate()
                .map(|(index, entry)| PoolEntryStatus {
                    index,
                    kind: entry.source.kind().to_string(),
                    state: entry.source.state().name().to_string(),
                    media_slot: entry.media_slot,
                    status: entry.source.status().map(str::to_string),
                    frames_presented: entry.source.stats().frames_presented(),
                })
                .collect(),
            controller: self.controller_state(),
        }
    }

    /// Close every source and free all GPU images
    pub fn shutdown(&mut self) {
        log::info!("Shutting down {} pooled sources", self.pool.len());
        for entry in &mut self.pool {
            entry.source.shutdown(&mut self.backend);
            entry.media_slot = None;
        }
        self.bindings.clear();
        for mixer in &mut self.mixers {
            *mixer = PlaneMixer::new(self.settings.fade_duration);
        }
        self.report_state();
    }

    pub fn mixers(&self) -> &[PlaneMixer] {
        &self.mixers
    }

    pub fn source(&self, index: usize) -> Option<&MediaSource<B>> {
        self.pool.get(index).map(|entry| &entry.source)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Entries that are not closed
    pub fn allocated_count(&self) -> usize {
        self.pool.iter().filter(|e| !e.source.is_closed()).count()
    }

    pub fn binding(&self, slot: u32) -> Option<usize> {
        self.bindings.get(&slot).copied()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &OperatorSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::LogReporter;
    use crate::error::ImportError;
    use crate::media::{DecodedFrame, GstSourceFactory};
    use common::SlotState;

    #[derive(Default)]
    struct CountingBackend {
        next: u32,
        live: usize,
    }

    impl GpuBackend for CountingBackend {
        type Image = u32;
        type Fence = u32;

        fn import(&mut self, _frame: &DecodedFrame) -> Result<u32, ImportError> {
            self.next += 1;
            self.live += 1;
            Ok(self.next)
        }

        fn destroy_image(&mut self, _image: u32) {
            self.live -= 1;
        }

        fn create_fence(&mut self) -> u32 {
            0
        }

        fn wait_fence(&mut self, _fence: &u32, _timeout: Duration) -> bool {
            true
        }

        fn destroy_fence(&mut self, _fence: u32) {}
    }

    fn operator(slots: &[(u32, &str)]) -> PlaybackOperator<CountingBackend> {
        let settings = OperatorSettings {
            fade_duration: Duration::from_millis(100),
            pool: PoolSettings {
                video: 0,
                capture: 0,
                procedural: 2,
                queue_capacity: 2,
            },
            slots: slots
                .iter()
                .map(|&(id, pattern)| (id, SourceDescriptor::new(SourceKind::Procedural, pattern)))
                .collect(),
            ..OperatorSettings::default()
        };
        let mut op = PlaybackOperator::new(
            settings,
            CountingBackend::default(),
            Box::new(GstSourceFactory::default()),
            Box::new(LogReporter::new()),
        );
        op.initialize();
        op
    }

    #[test]
    fn test_output_mapping() {
        let op = operator(&[]);
        assert_eq!(op.output_for(0), 0);
        assert_eq!(op.output_for(7), 0);
        assert_eq!(op.output_for(8), 1);
        assert_eq!(op.output_for(16), 0);
    }

    #[test]
    fn test_unknown_slot() {
        let mut op = operator(&[]);
        assert_eq!(op.show_media(3), Err(ShowMediaError::UnknownSlot(3)));
        assert_eq!(op.allocated_count(), 0);
    }

    #[test]
    fn test_failed_open_leaves_entry_free() {
        let mut op = operator(&[(0, "no-such-pattern")]);
        assert!(matches!(op.show_media(0), Err(ShowMediaError::Source(_))));
        assert_eq!(op.allocated_count(), 0);
        assert!(op.source(0).unwrap().status().is_some());
        assert!(!op.mixers()[0].is_fading());
    }

    #[test]
    fn test_show_and_controller_state() {
        let mut op = operator(&[(0, "solid:#ff0000"), (1, "bars")]);
        let index = op.show_media(0).unwrap();
        assert_eq!(op.binding(0), Some(index));
        assert!(op.mixers()[0].is_fading());

        let state = op.controller_state();
        assert_eq!(state.media[0], SlotState::ProceduralActive);
        assert_eq!(state.media[1], SlotState::Procedural);
        assert_eq!(state.media[2], SlotState::Empty);

        assert_eq!(op.show_media(1), Err(ShowMediaError::MixerBusy(0)));
        op.shutdown();
        assert_eq!(op.allocated_count(), 0);
        assert_eq!(op.backend().live, 0);
    }

    #[test]
    fn test_set_looping_unknown_slot() {
        let mut op = operator(&[(0, "bars")]);
        assert!(op.set_looping(0, false).is_ok());
        assert!(!op.settings().slots[&0].looping);
        assert_eq!(op.set_looping(9, true), Err(ShowMediaError::UnknownSlot(9)));
    }

    #[test]
    fn test_from_config() {
        let toml = r#"
[general]
fade_time_ms = 500
outputs = 3

[[slot]]
id = 4
kind = "procedural"
source = "plasma"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let settings = OperatorSettings::from_config(&config).unwrap();
        assert_eq!(settings.outputs, 3);
        assert_eq!(settings.fade_duration, Duration::from_millis(500));
        assert_eq!(settings.slots[&4].location, "plasma");
        assert_eq!(settings.source.fence_timeout, Duration::from_millis(50));
    }
}
