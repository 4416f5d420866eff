//! One pass of the background shadow drainer.

use std::sync::Arc;

use tracing::{debug, error};

use super::{CrateInner, CrateState, ModuleCell, ModuleSlot};
use crate::shadow::carve_arena;

/// Closure the [`ShadowTask`](crate::shadow::ShadowTask) thread runs
/// repeatedly.
pub(super) fn sweeper(inner: Arc<CrateInner>) -> impl FnMut() + Send + 'static {
    move || sweep(&inner)
}

fn readable(cell: &ModuleCell) -> bool {
    cell.supports_shadow && !cell.is_barrier && cell.slot.lock().core.event_max != 0
}

fn sweep(inner: &CrateInner) {
    let mut shared = inner.shared.lock();
    if shared.state == CrateState::Reinit {
        return;
    }

    if shared.shadow_rebuild {
        let cells: Vec<&ModuleCell> = inner.modules.iter().filter(|cell| readable(cell)).collect();
        let pairs = carve_arena(inner.settings.shadow_bytes, shared.shadow_readable, cells.len());
        for (cell, (a, b)) in cells.iter().zip(pairs) {
            cell.shadow.lock().rebuild(a, b);
        }
        shared.shadow_rebuild = false;
        debug!(crate_name = inner.name(), modules = cells.len(), "Shadow buffers rebuilt");
    }

    for cell in inner.modules.iter().filter(|cell| cell.supports_shadow) {
        let mut slot = cell.slot.lock();
        if slot.core.event_max == 0 {
            continue;
        }
        let mut pair = cell.shadow.lock();
        if !pair.is_built() {
            continue;
        }
        let ModuleSlot { core, driver, .. } = &mut *slot;
        let fail = pair.write_side().fill(|eb| driver.readout_shadow(core, eb));
        core.result |= fail;
        if !fail.is_ok() {
            error!(
                crate_name = inner.name(),
                module_id = core.id,
                kind = %cell.kind,
                ?fail,
                "Shadow readout failed"
            );
            pair.write_side().reset();
            shared.state = CrateState::Reinit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrateSettings;
    use crate::error::ReadoutFail;
    use crate::mock::{self, MockModule};
    use crate::module::DriverRegistry;
    use crate::readout_crate::ReadoutCrate;

    fn prepared(toml: &str) -> ReadoutCrate {
        let mut drivers = DriverRegistry::new();
        mock::register(&mut drivers);
        let settings = CrateSettings::from_toml_str(toml).unwrap();
        let crate_ = ReadoutCrate::create(&settings, &drivers).unwrap();
        {
            let mut shared = crate_.inner.shared.lock();
            shared.state = CrateState::Prepared;
            shared.shadow_rebuild = true;
            shared.shadow_readable = 1;
        }
        crate_
    }

    #[test]
    fn test_failed_drain_discards_write_side() {
        let crate_ = prepared("shadow_bytes = 64\n[[module]]\nkind = \"mock\"\nshadow = true\nevent_max = 4\n");
        let inner = &crate_.inner;
        let cell = &inner.modules[0];
        let hw = cell
            .slot
            .lock()
            .driver
            .as_any_mut()
            .downcast_mut::<MockModule>()
            .map(|m| m.hardware())
            .unwrap();

        hw.lock().trigger(2);
        sweep(inner);
        assert_eq!(crate_.state(), CrateState::Prepared);
        assert_eq!(cell.shadow.lock().write_side().written().len(), 8);
        cell.shadow.lock().swap();
        assert_eq!(cell.shadow.lock().published().len(), 8);

        {
            let mut hw = hw.lock();
            hw.fail_shadow = true;
            hw.trigger(2);
        }
        sweep(inner);
        assert_eq!(crate_.state(), CrateState::Reinit);
        assert!(cell.slot.lock().core.result().contains(ReadoutFail::ERROR_DRIVER));
        let mut pair = cell.shadow.lock();
        assert!(pair.write_side().written().is_empty());
        assert!(hw.lock().pending.is_empty());
        pair.swap();
        assert!(pair.published().is_empty());
    }

    #[test]
    fn test_sweep_idles_while_reinit() {
        let crate_ = prepared("shadow_bytes = 64\n[[module]]\nkind = \"mock\"\nshadow = true\nevent_max = 4\n");
        let inner = &crate_.inner;
        inner.shared.lock().state = CrateState::Reinit;
        let hw = inner.modules[0]
            .slot
            .lock()
            .driver
            .as_any_mut()
            .downcast_mut::<MockModule>()
            .map(|m| m.hardware())
            .unwrap();

        hw.lock().trigger(1);
        sweep(inner);
        assert_eq!(hw.lock().pending.len(), 1);
        assert!(!inner.modules[0].shadow.lock().is_built());
        assert!(inner.shared.lock().shadow_rebuild);
    }
}
