//! Connectivity and visibility signals from the host environment.
//!
//! The engine never inspects the network stack or the window system itself.
//! The embedding application owns an [`EnvironmentHandle`] and reports
//! changes through it; the engine holds the matching [`Environment`] and
//! reacts (reconnecting when the device comes back online, marking
//! messages seen when the conversation becomes visible).

use tokio::sync::watch;

/// Snapshot of the environment as last reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentState {
    /// The device has network connectivity.
    pub online: bool,
    /// The conversation is on screen.
    pub visible: bool,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            online: true,
            visible: true,
        }
    }
}

/// Host-side handle used to publish environment changes.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    tx: watch::Sender<EnvironmentState>,
}

impl EnvironmentHandle {
    /// Report network connectivity.
    pub fn set_online(&self, online: bool) {
        self.tx.send_modify(|s| s.online = online);
    }

    /// Report whether the conversation is on screen.
    pub fn set_visible(&self, visible: bool) {
        self.tx.send_modify(|s| s.visible = visible);
    }
}

/// Engine-side view of the environment.
#[derive(Debug, Clone)]
pub struct Environment {
    rx: watch::Receiver<EnvironmentState>,
}

impl Environment {
    /// Create a connected handle/receiver pair starting from `initial`.
    #[must_use]
    pub fn channel(initial: EnvironmentState) -> (EnvironmentHandle, Self) {
        let (tx, rx) = watch::channel(initial);
        (EnvironmentHandle { tx }, Self { rx })
    }

    /// An environment that is always online and visible.
    ///
    /// Used headlessly (tests, the terminal client) where no host signals exist.
    #[must_use]
    pub fn always_online() -> Self {
        let (_, env) = Self::channel(EnvironmentState::default());
        env
    }

    /// The most recently reported state.
    #[must_use]
    pub fn current(&self) -> EnvironmentState {
        *self.rx.borrow()
    }

    /// Wait for the next reported change.
    ///
    /// Never resolves once the host handle has been dropped, so it can sit in
    /// a `select!` without spinning.
    pub async fn changed(&mut self) -> EnvironmentState {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }

    /// Resolve as soon as the environment reports being online.
    pub async fn wait_online(&mut self) {
        while !self.rx.borrow_and_update().online {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
