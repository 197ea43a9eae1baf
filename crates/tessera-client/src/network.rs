use tessera_reactive::{Computed, Scope, Signal};

/// Per-query policy for how network state gates fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Fetches pause while offline.
    #[default]
    Online,
    /// Fetches run regardless of network state.
    Always,
    /// Fetches pause while offline only when no cached data exists yet.
    OfflineFirst,
}

/// Holds the online cell. Embedders push platform connectivity through
/// [`NetworkManager::set_probe_status`]; a manual override takes precedence
/// until cleared.
#[derive(Clone)]
pub struct NetworkManager {
    probe: Signal<bool>,
    manual: Signal<Option<bool>>,
    online: Computed<bool>,
}

impl NetworkManager {
    pub fn new(scope: &Scope, initially_online: bool) -> Self {
        let probe = Signal::new(scope, initially_online);
        let manual = Signal::new(scope, None::<bool>);
        let online = Computed::new(scope, {
            let (probe, manual) = (probe.clone(), manual.clone());
            move || manual.get().unwrap_or_else(|| probe.get())
        });
        Self {
            probe,
            manual,
            online,
        }
    }

    /// Current effective online state (reactive read).
    pub fn is_online(&self) -> bool {
        self.online.get()
    }

    /// The online state as a reactive computed, for subscribers.
    pub fn get_online_signal(&self) -> Computed<bool> {
        self.online.clone()
    }

    /// Manually forces the online state until cleared.
    pub fn set_network_status(&self, online: bool) {
        self.manual.set(Some(online));
    }

    /// Drops the manual override, reverting to the platform probe.
    pub fn clear_manual_override(&self) {
        self.manual.set(None);
    }

    /// Feeds a platform connectivity event into the probe cell.
    pub fn set_probe_status(&self, online: bool) {
        self.probe.set(online);
    }
}
