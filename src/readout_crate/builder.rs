//! Building a crate from its ordered entries.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CrateInner, CrateState, ModuleCell, ModuleSlot, ReadoutCrate, Shared};
use crate::acvt::AcvtLoop;
use crate::config::{ConfigBlock, CrateSettings, EntryConfig};
use crate::counter::{CrateCounter, AUTO_PREFIX};
use crate::dt_release::DeadtimeRelease;
use crate::error::{CrateError, CrateResult};
use crate::module::{
    signatures_overlap, Barrier, BuildContext, DriverRegistry, IdRegistry, ModuleCore, SharedDevice,
};
use crate::shadow::ShadowPair;
use crate::tag::{Scaler, Tag, DEFAULT_TAG};
use crate::transport::Transport;

/// Kind of a barrier entry.
pub const BARRIER_KIND: &str = "barrier";

/// Mutable state while walking the entries.
struct Layout {
    slots: Vec<ModuleSlot>,
    barriers: Vec<bool>,
    tags: Vec<Tag>,
    active: Vec<usize>,
    counters: Vec<CrateCounter>,
    counter: usize,
    scalers: Vec<Scaler>,
    next_id: u32,
    module_num: usize,
    acvt_module: Option<usize>,
    event_limit: Option<(usize, String)>,
    shared_device: Option<(Box<dyn SharedDevice>, ConfigBlock)>,
}

impl Layout {
    fn new() -> Self {
        let mut default = Tag::new(DEFAULT_TAG);
        default.add_counter(0);
        Self {
            slots: Vec::new(),
            barriers: Vec::new(),
            tags: vec![default],
            active: vec![0],
            counters: vec![CrateCounter::new(format!("{}{}", AUTO_PREFIX, DEFAULT_TAG))],
            counter: 0,
            scalers: Vec::new(),
            next_id: 0,
            module_num: 0,
            acvt_module: None,
            event_limit: None,
            shared_device: None,
        }
    }

    fn tag_index(&mut self, name: &str) -> usize {
        match self.tags.iter().position(|tag| tag.name == name) {
            Some(index) => index,
            None => {
                self.tags.push(Tag::new(name));
                self.tags.len() - 1
            }
        }
    }

    fn counter_index(&mut self, name: &str) -> usize {
        match self.counters.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.counters.push(CrateCounter::new(name));
                self.counters.len() - 1
            }
        }
    }

    fn describe(&self, index: usize) -> String {
        let core = &self.slots[index].core;
        format!("{}[{}]", core.kind, core.id)
    }

    /// Check a new data-producing module against the earlier members of
    /// every active tag, back to the nearest barrier.
    fn check_signatures(&self, new: &ModuleSlot) -> CrateResult<()> {
        let new_sig = new.driver.signature();
        for &tag_index in &self.active {
            let tag = &self.tags[tag_index];
            for &index in tag.modules.iter().rev() {
                if self.barriers[index] {
                    break;
                }
                let old = &self.slots[index];
                if old.core.event_max == 0 {
                    continue;
                }
                if signatures_overlap(old.driver.signature(), new_sig) {
                    return Err(CrateError::AmbiguousSignature {
                        tag: tag.name.clone(),
                        old_kind: old.core.kind.clone(),
                        old_id: old.core.id,
                        new_kind: new.core.kind.clone(),
                        new_id: new.core.id,
                    });
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, slot: ModuleSlot, barrier: bool) -> usize {
        let index = self.slots.len();
        self.slots.push(slot);
        self.barriers.push(barrier);
        for &tag_index in &self.active {
            let tag = &mut self.tags[tag_index];
            tag.modules.push(index);
            if !barrier {
                tag.module_num += 1;
            }
        }
        index
    }

    fn add_tags(&mut self, entry_index: usize, entry: &EntryConfig) -> CrateResult<()> {
        let names: Vec<String> = entry
            .params
            .get("names")
            .and_then(toml::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if names.is_empty() {
            return Err(CrateError::EmptyTagList);
        }
        let counter_name = match entry.params.get("scaler").and_then(toml::Value::as_str) {
            Some(scaler) => scaler.to_string(),
            None => format!("{}{}", AUTO_PREFIX, entry_index),
        };
        let counter = self.counter_index(&counter_name);
        self.active.clear();
        for name in &names {
            let tag_index = self.tag_index(name);
            self.tags[tag_index].add_counter(counter);
            if !self.active.contains(&tag_index) {
                self.active.push(tag_index);
            }
        }
        self.counter = counter;
        debug!(tags = ?names, counter = %counter_name, "Active tags changed");
        Ok(())
    }

    fn add_barrier(&mut self) {
        let mut core = ModuleCore::new(u32::MAX, BARRIER_KIND);
        core.crate_counter = self.counter;
        let slot = ModuleSlot {
            core,
            driver: Box::new(Barrier),
            config: ConfigBlock::default(),
        };
        self.insert(slot, true);
    }

    fn add_shared_device(&mut self, entry: &EntryConfig, drivers: &DriverRegistry) -> CrateResult<()> {
        if self.shared_device.is_some() {
            return Err(CrateError::DuplicateSharedDevice);
        }
        let mut params = entry.params.clone();
        let kind = match params.remove("type") {
            Some(toml::Value::String(kind)) => kind,
            _ => return Err(CrateError::UnknownSharedDevice(String::new())),
        };
        let factory = drivers
            .shared_device(&kind)
            .ok_or_else(|| CrateError::UnknownSharedDevice(kind.clone()))?;
        let config = ConfigBlock::new(params);
        let device = factory(&config).map_err(|source| CrateError::ModuleCreate {
            kind: kind.clone(),
            source,
        })?;
        debug!(kind = %kind, "Shared prerequisite device declared");
        self.shared_device = Some((device, config));
        Ok(())
    }

    fn add_module(
        &mut self,
        settings: &CrateSettings,
        entry: &EntryConfig,
        drivers: &DriverRegistry,
    ) -> CrateResult<()> {
        let factory = drivers
            .factory(&entry.kind)
            .ok_or_else(|| CrateError::UnknownModuleType(entry.kind.clone()))?;
        let config = ConfigBlock::new(entry.params.clone());
        let mut core = ModuleCore::new(self.next_id, entry.kind.as_str());
        let mut ctx = BuildContext::new(&mut core, &config);
        let driver = factory(&mut ctx).map_err(|source| CrateError::ModuleCreate {
            kind: entry.kind.clone(),
            source,
        })?;
        let BuildContext {
            scalers,
            acvt,
            needs_shared_device,
            event_limit_tag,
            ..
        } = ctx;
        self.next_id += 1;
        core.crate_counter = self.counter;

        let slot = ModuleSlot { core, driver, config };
        if slot.core.event_max != 0 {
            self.check_signatures(&slot)?;
        }
        let index = self.slots.len();

        for (channel, name) in scalers.into_iter().enumerate() {
            if self.scalers.iter().any(|s| s.name == name) {
                return Err(CrateError::DuplicateScaler(name));
            }
            self.scalers.push(Scaler {
                name,
                module: index,
                channel,
            });
        }
        if acvt && settings.acvt {
            if self.acvt_module.is_none() {
                self.acvt_module = Some(index);
            } else {
                warn!(module = index, "Adaptive timing already taken by another module");
            }
        }
        if let Some(tag) = event_limit_tag {
            if let Some((first, _)) = &self.event_limit {
                return Err(CrateError::EventLimitConflict {
                    first: self.describe(*first),
                    second: format!("{}[{}]", slot.core.kind, slot.core.id),
                });
            }
            self.event_limit = Some((index, tag));
        }
        if needs_shared_device {
            for &tag_index in &self.active {
                self.tags[tag_index].needs_shared_device = true;
            }
        }

        debug!(
            module_id = slot.core.id,
            kind = %slot.core.kind,
            event_max = slot.core.event_max,
            "Module added"
        );
        self.insert(slot, false);
        self.module_num += 1;
        Ok(())
    }
}

impl ReadoutCrate {
    /// Build a crate from `settings`, creating modules through `drivers`.
    ///
    /// The crate starts in REINIT; call [`init`](Self::init) before reading.
    pub fn create(settings: &CrateSettings, drivers: &DriverRegistry) -> CrateResult<Self> {
        settings.validate()?;
        let mut layout = Layout::new();

        for (entry_index, entry) in settings.entries.iter().enumerate() {
            match entry.kind.as_str() {
                "tags" => layout.add_tags(entry_index, entry)?,
                "id_skip" => {
                    let skip = entry
                        .params
                        .get("count")
                        .and_then(toml::Value::as_integer)
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(1);
                    layout.next_id += skip;
                }
                BARRIER_KIND => layout.add_barrier(),
                "shared_device" => layout.add_shared_device(entry, drivers)?,
                _ => layout.add_module(settings, entry, drivers)?,
            }
        }

        if layout.shared_device.is_none() && layout.tags.iter().any(|tag| tag.needs_shared_device) {
            return Err(CrateError::MissingSharedDevice);
        }
        for counter in &mut layout.counters {
            if counter.is_auto() {
                continue;
            }
            let scaler = layout
                .scalers
                .iter()
                .position(|s| s.name == counter.name)
                .ok_or_else(|| CrateError::UndefinedScaler(counter.name.clone()))?;
            counter.scaler = Some(scaler);
        }
        if settings.acvt && layout.acvt_module.is_none() {
            return Err(CrateError::AcvtWithoutModule);
        }
        let event_limit = match layout.event_limit.take() {
            Some((module, tag)) => {
                let tag_index = layout
                    .tags
                    .iter()
                    .position(|t| t.name == tag)
                    .ok_or(CrateError::UnknownTag(tag))?;
                Some((module, tag_index))
            }
            None => None,
        };

        let mut joint = Vec::new();
        for (slot, &barrier) in layout.slots.iter().zip(&layout.barriers) {
            let kind = &slot.core.kind;
            if barrier || joint.iter().any(|(k, _)| k == kind) {
                continue;
            }
            if let Some(pass) = drivers.joint_init(kind) {
                joint.push((kind.clone(), Arc::clone(pass)));
            }
        }

        let modules: Vec<ModuleCell> = layout
            .slots
            .into_iter()
            .zip(layout.barriers)
            .map(|(slot, is_barrier)| ModuleCell {
                kind: slot.core.kind.clone(),
                supports_shadow: slot.driver.supports_shadow(),
                flags: slot.driver.flags(),
                is_barrier,
                shadow: Mutex::new(ShadowPair::default()),
                slot: Mutex::new(slot),
            })
            .collect();

        let (shared_device, shared_device_config) = match layout.shared_device {
            Some((device, config)) => (Some(device), config),
            None => (None, ConfigBlock::default()),
        };

        let mut acvt = AcvtLoop::new(&settings.timing);
        if let Some(module) = layout.acvt_module {
            acvt.attach(module);
        }

        info!(
            crate_name = %settings.name,
            modules = layout.module_num,
            tags = layout.tags.len(),
            transport = ?settings.transport,
            shadow_bytes = settings.shadow_bytes,
            "Crate built"
        );

        let inner = CrateInner {
            settings: settings.clone(),
            modules,
            scalers: layout.scalers,
            joint,
            event_limit,
            module_num: layout.module_num,
            shared: Mutex::new(Shared {
                state: CrateState::Reinit,
                counters: layout.counters,
                tags: layout.tags,
                shared_device,
                shared_device_config,
                ids: IdRegistry::new(),
                reconfig: Vec::new(),
                shadow_rebuild: true,
                shadow_readable: 0,
                shadow_max_bytes: 0,
                acvt_ns: 0,
            }),
        };

        Ok(ReadoutCrate {
            inner: Arc::new(inner),
            dt_release: DeadtimeRelease::new(settings.deadtime_release),
            acvt,
            transport: Transport::new(settings.transport),
            free_running: settings.free_running,
            sync: Vec::new(),
            shadow_task: None,
            on_init: None,
            on_deinit: None,
        })
    }
}
