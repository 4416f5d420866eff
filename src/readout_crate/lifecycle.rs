//! Init pipeline, teardown and the finalize phase.

use std::sync::Arc;
use std::thread;

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use super::{CrateInner, CrateState, ModuleSlot, ReadoutCrate, Shared};
use crate::error::{CrateError, CrateResult, ReadoutFail};
use crate::module::{IdRegistry, InitContext, JointInit, JointMember};
use crate::shadow::ShadowTask;
use crate::tag::tag_event_max;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Slow,
    Fast,
    Post,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::Slow => "init_slow",
            Hook::Fast => "init_fast",
            Hook::Post => "post_init",
        }
    }
}

/// Run one init hook of a module.
///
/// `Ok(false)` means the attempt failed and should be retried; errors are
/// fatal.
fn run_hook(
    slot: &mut ModuleSlot,
    ids: &mut IdRegistry,
    hook: Hook,
    free_running: bool,
    shadow_active: bool,
) -> CrateResult<bool> {
    let ModuleSlot { core, driver, config } = slot;
    let mut init_id = core.id;
    let mut ctx = InitContext::new(core, config, &mut init_id, free_running, shadow_active);
    let result = match hook {
        Hook::Slow => driver.init_slow(&mut ctx),
        Hook::Fast => driver.init_fast(&mut ctx),
        Hook::Post => driver.post_init(&mut ctx),
    };
    if let Some(fatal) = ctx.take_fatal() {
        return Err(fatal);
    }
    drop(ctx);
    if let Err(e) = result {
        warn!(
            module_id = core.id,
            kind = %core.kind,
            hook = hook.name(),
            error = ?e,
            "Module init failed"
        );
        return Ok(false);
    }
    if hook != Hook::Post {
        ids.mark(init_id)?;
    }
    Ok(true)
}

/// Run a joint pass over modules of `kind`, or only over `only` if given.
fn run_joint(inner: &CrateInner, kind: &str, pass: &JointInit, only: Option<&[usize]>) -> bool {
    let mut guards: Vec<MutexGuard<'_, ModuleSlot>> = inner
        .modules
        .iter()
        .enumerate()
        .filter(|(index, cell)| {
            !cell.is_barrier && cell.kind == kind && only.map_or(true, |o| o.contains(index))
        })
        .map(|(_, cell)| cell.slot.lock())
        .collect();
    if guards.is_empty() {
        return true;
    }
    let mut members: Vec<JointMember<'_>> = guards
        .iter_mut()
        .map(|guard| {
            let ModuleSlot { core, driver, .. } = &mut **guard;
            JointMember {
                core,
                module: driver.as_mut(),
            }
        })
        .collect();
    match pass(&mut members) {
        Ok(()) => true,
        Err(e) => {
            warn!(kind, error = ?e, "Joint init pass failed");
            false
        }
    }
}

impl CrateInner {
    /// Read scaler `index` from its module.
    pub(crate) fn read_scaler(&self, index: usize) -> Result<u32, ReadoutFail> {
        let scaler = &self.scalers[index];
        let mut slot = self.modules[scaler.module].slot.lock();
        let ModuleSlot { core, driver, .. } = &mut *slot;
        driver.read_scaler(core, scaler.channel)
    }

    /// Ask every module whether it has leftover data.
    pub(crate) fn check_empty(&self, shared: &mut Shared) -> ReadoutFail {
        let mut result = ReadoutFail::empty();
        for cell in self.modules.iter().filter(|cell| !cell.is_barrier) {
            let mut slot = cell.slot.lock();
            let ModuleSlot { core, driver, .. } = &mut *slot;
            let fail = driver.check_empty(core);
            if !fail.is_ok() {
                error!(
                    crate_name = self.name(),
                    module_id = core.id,
                    kind = %cell.kind,
                    ?fail,
                    "Module not empty"
                );
                shared.state = CrateState::Reinit;
                result |= fail;
            }
        }
        result
    }
}

impl ReadoutCrate {
    /// Initialize the crate, retrying until it succeeds or a fatal error
    /// occurs. Ends in PREPARED.
    pub fn init(&mut self) -> CrateResult<()> {
        info!(crate_name = self.name(), "Initializing crate");
        let mut attempt = 1u32;
        loop {
            if self.try_init()? {
                return Ok(());
            }
            warn!(
                crate_name = self.name(),
                attempt,
                sleep = ?self.inner.settings.reinit_sleep,
                "Crate init failed, retrying"
            );
            self.deinit();
            thread::sleep(self.inner.settings.reinit_sleep);
            attempt += 1;
        }
    }

    fn try_init(&mut self) -> CrateResult<bool> {
        let inner = Arc::clone(&self.inner);
        {
            let mut guard = inner.shared.lock();
            let prepared = self.init_locked(&inner, &mut guard);
            // Ids marked by an aborted round must not collide with the retry.
            guard.ids.clear();
            if !prepared? {
                return Ok(false);
            }
            guard.state = CrateState::Prepared;
            guard.shadow_rebuild = true;
        }

        if inner.do_shadow() {
            let sweep = super::shadow_sweep::sweeper(Arc::clone(&inner));
            match ShadowTask::spawn(inner.name(), sweep) {
                Ok(task) => self.shadow_task = Some(task),
                Err(e) => {
                    inner.shared.lock().state = CrateState::Reinit;
                    return Err(CrateError::Thread(e));
                }
            }
        }

        if let Some(callback) = self.on_init.as_mut() {
            callback(inner.name());
        }
        info!(
            crate_name = inner.name(),
            modules = inner.module_num,
            shadow = inner.do_shadow(),
            "Crate initialized"
        );
        Ok(true)
    }

    fn init_locked(&self, inner: &CrateInner, shared: &mut Shared) -> CrateResult<bool> {
        let free_running = self.free_running;
        let shadow_active = inner.do_shadow();
        let name = inner.name();

        if let Some(device) = shared.shared_device.as_mut() {
            if let Err(e) = device.init(&shared.shared_device_config) {
                warn!(crate_name = name, error = ?e, "Shared device init failed");
                return Ok(false);
            }
        }
        shared.shadow_readable = 0;

        debug!(crate_name = name, "Slow init");
        for cell in inner.modules.iter().filter(|cell| !cell.is_barrier) {
            let mut slot = cell.slot.lock();
            if !run_hook(&mut slot, &mut shared.ids, Hook::Slow, free_running, shadow_active)? {
                return Ok(false);
            }
        }
        shared.ids.clear();

        let event_max_override = inner.settings.event_max_override;
        for tag in &mut shared.tags {
            let capacities: Vec<u32> = tag
                .modules
                .iter()
                .map(|&index| inner.modules[index].slot.lock().core.event_max)
                .collect();
            tag.event_max = tag_event_max(capacities, event_max_override, shadow_active).map_err(
                |(requested, capacity)| CrateError::EventMaxOverride {
                    tag: tag.name.clone(),
                    requested,
                    capacity,
                },
            )?;
            debug!(crate_name = name, tag = %tag.name, event_max = tag.event_max, "Tag event_max");
        }
        if let Some((module, tag)) = inner.event_limit {
            let limit = shared.tags[tag].event_max;
            inner.modules[module].slot.lock().driver.set_event_limit(limit);
        }

        debug!(crate_name = name, "Fast init");
        for cell in inner.modules.iter().filter(|cell| !cell.is_barrier) {
            let mut slot = cell.slot.lock();
            if !run_hook(&mut slot, &mut shared.ids, Hook::Fast, free_running, shadow_active)? {
                return Ok(false);
            }
        }
        shared.ids.clear();
        for (kind, pass) in &inner.joint {
            if !run_joint(inner, kind, pass, None) {
                return Ok(false);
            }
        }

        if !inner.settings.postinit_sleep.is_zero() {
            thread::sleep(inner.settings.postinit_sleep);
        }

        for cell in inner.modules.iter().filter(|cell| !cell.is_barrier) {
            let mut slot = cell.slot.lock();
            if !run_hook(&mut slot, &mut shared.ids, Hook::Post, free_running, shadow_active)? {
                return Ok(false);
            }
            slot.config.assert_consulted(&slot.core.kind, slot.core.id)?;
        }

        if let Some(device) = shared.shared_device.as_mut() {
            device.reset();
        }

        for index in 0..shared.counters.len() {
            let mut value = 0;
            if let Some(scaler) = shared.counters[index].scaler {
                match inner.read_scaler(scaler) {
                    Ok(v) => value = v,
                    Err(fail) => {
                        warn!(
                            crate_name = name,
                            counter = %shared.counters[index].name,
                            ?fail,
                            "Scaler read failed during init"
                        );
                        return Ok(false);
                    }
                }
            }
            let counter = &mut shared.counters[index];
            counter.cur.mask = u32::MAX;
            counter.cur.value = value;
            counter.prev = counter.cur;
        }

        if !free_running && !inner.check_empty(shared).is_ok() {
            return Ok(false);
        }

        for cell in &inner.modules {
            let mut slot = cell.slot.lock();
            let core = &mut slot.core;
            let crate_counter = shared.counters[core.crate_counter].cur;
            core.result = ReadoutFail::empty();
            core.latch(crate_counter);
            core.crate_counter_prev = crate_counter.value;
            if cell.supports_shadow && core.event_max != 0 {
                shared.shadow_readable += 1;
            }
        }
        Ok(true)
    }

    /// Tear the crate down. Safe to call any number of times; always ends in
    /// REINIT.
    pub fn deinit(&mut self) {
        let inner = Arc::clone(&self.inner);
        if let Some(callback) = self.on_deinit.as_mut() {
            callback(inner.name());
        }
        if let Some(mut task) = self.shadow_task.take() {
            task.stop();
        }
        let mut shared = inner.shared.lock();
        for cell in &inner.modules {
            let mut slot = cell.slot.lock();
            let ModuleSlot { core, driver, .. } = &mut *slot;
            driver.deinit(core);
        }
        if let Some(device) = shared.shared_device.as_mut() {
            device.deinit();
        }
        shared.state = CrateState::Reinit;
        debug!(crate_name = inner.name(), "Crate deinitialized");
    }

    /// Close the trigger: latch counters, then either recover from a failure
    /// or apply queued reconfigurations.
    pub fn finalize(&mut self) -> CrateResult<()> {
        let inner = Arc::clone(&self.inner);
        let state = {
            let mut shared = inner.shared.lock();
            for counter in &mut shared.counters {
                counter.latch();
            }
            shared.state
        };

        if state == CrateState::Reinit {
            error!(crate_name = inner.name(), "Crate had problems, re-initializing");
            self.deinit();
            thread::sleep(inner.settings.reinit_sleep);
            self.init()?;
            // Triggers may have been accepted while deadtime was released.
            if !self.dt_release.is_on() {
                inner.shared.lock().state = CrateState::Reinit;
            }
        } else if self.dt_release.is_on() {
            self.reconfigure()?;
        }
        Ok(())
    }

    /// Rerun fast-init and post-init for every module with written config.
    fn reconfigure(&mut self) -> CrateResult<()> {
        let inner = Arc::clone(&self.inner);
        let mut guard = inner.shared.lock();
        let shared = &mut *guard;
        if shared.reconfig.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut shared.reconfig);
        let free_running = self.free_running;
        let shadow_active = inner.do_shadow();

        let mut kinds: Vec<&str> = Vec::new();
        let mut fatal = None;
        for &index in &pending {
            let cell = &inner.modules[index];
            let mut slot = cell.slot.lock();
            info!(
                crate_name = inner.name(),
                module_id = slot.core.id,
                kind = %cell.kind,
                "Module re-config"
            );
            let fast = run_hook(&mut slot, &mut shared.ids, Hook::Fast, free_running, shadow_active);
            let post = run_hook(&mut slot, &mut shared.ids, Hook::Post, free_running, shadow_active);
            match fast.and_then(|fast| post.map(|post| fast && post)) {
                Ok(true) => {}
                Ok(false) => shared.state = CrateState::Reinit,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
            let crate_counter = shared.counters[slot.core.crate_counter].cur;
            slot.core.latch(crate_counter);
            if !kinds.contains(&cell.kind.as_str()) {
                kinds.push(&cell.kind);
            }
        }
        shared.ids.clear();
        if let Some(e) = fatal {
            shared.state = CrateState::Reinit;
            return Err(e);
        }

        for (kind, pass) in &inner.joint {
            if kinds.contains(&kind.as_str()) && !run_joint(&inner, kind, pass, None) {
                shared.state = CrateState::Reinit;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrateSettings;
    use crate::mock::{self, MockModule};
    use crate::module::DriverRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn build(toml: &str) -> ReadoutCrate {
        let mut drivers = DriverRegistry::new();
        mock::register(&mut drivers);
        let settings = CrateSettings::from_toml_str(toml).unwrap();
        ReadoutCrate::create(&settings, &drivers).unwrap()
    }

    #[test]
    fn test_init_reaches_prepared_and_deinit_is_idempotent() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        crate_.init().unwrap();
        assert_eq!(crate_.state(), CrateState::Prepared);
        crate_.deinit();
        crate_.deinit();
        assert_eq!(crate_.state(), CrateState::Reinit);
    }

    #[test]
    fn test_init_retries_failed_module() {
        let mut crate_ = build("reinit_sleep = \"1ms\"\n[[module]]\nkind = \"mock\"\nfail_init = 2\n");
        crate_.init().unwrap();
        assert_eq!(crate_.state(), CrateState::Prepared);
        let hw = crate_
            .with_module(0, |_, m| MockModule::downcast(m).map(|m| m.hardware()))
            .flatten()
            .unwrap();
        let hw = hw.lock();
        assert_eq!(hw.fast_inits, 3);
        assert!(hw.deinits >= 2);
    }

    #[test]
    fn test_unconsulted_config_is_fatal() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\nunread = 1\n");
        let err = crate_.init().unwrap_err();
        assert!(matches!(err, CrateError::UnusedConfig { keys, .. } if keys == vec!["unread".to_string()]));
    }

    #[test]
    fn test_duplicate_remapped_id_is_fatal() {
        let mut crate_ = build(
            "[[module]]\nkind = \"mock\"\nremap_id = 7\n[[module]]\nkind = \"mock\"\nremap_id = 7\n",
        );
        let err = crate_.init().unwrap_err();
        assert!(matches!(err, CrateError::DuplicateModuleId { id: 7 }));
    }

    #[test]
    fn test_event_max_override_too_large_is_fatal() {
        let mut crate_ = build("event_max_override = 10\n[[module]]\nkind = \"mock\"\nevent_max = 4\n");
        let err = crate_.init().unwrap_err();
        assert!(matches!(
            err,
            CrateError::EventMaxOverride { requested: 10, capacity: 4, .. }
        ));
    }

    #[test]
    fn test_event_limit_delegation() {
        let mut crate_ = build(
            "[[module]]\nkind = \"mock\"\nevent_max = 16\n[[module]]\nkind = \"mock\"\nevent_max = 8\nevent_limit = \"Default\"\n",
        );
        crate_.init().unwrap();
        assert_eq!(crate_.get_tag_by_name(None).unwrap().event_max, 8);
        let limit = crate_
            .with_module(1, |_, m| MockModule::downcast(m).map(|m| m.hardware().lock().event_limit))
            .flatten()
            .unwrap();
        assert_eq!(limit, Some(8));
    }

    #[test]
    fn test_callbacks_run() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        let inits = Arc::new(AtomicU32::new(0));
        let deinits = Arc::new(AtomicU32::new(0));
        let (i, d) = (inits.clone(), deinits.clone());
        crate_.set_init_callback(Box::new(move |_| {
            i.fetch_add(1, Ordering::SeqCst);
        }));
        crate_.set_deinit_callback(Box::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        crate_.init().unwrap();
        crate_.deinit();
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(deinits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_joint_pass_runs_after_fast_init() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\n");
        crate_.init().unwrap();
        for index in 0..2 {
            let joint = crate_
                .with_module(index, |_, m| MockModule::downcast(m).map(|m| m.hardware().lock().joint_inits))
                .flatten()
                .unwrap();
            assert_eq!(joint, 1);
        }
    }
}
