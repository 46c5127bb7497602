//! Host lifecycle signals and the policy that maps them to connection actions.
//!
//! Hosts report visibility changes, OS freeze/resume, and page hide/show
//! through a [`LifecycleSender`](crate::stream::client::LifecycleSender). The
//! [`BackgroundingPolicy`] decides which of those signals is trusted as the
//! authoritative "went to background" indicator.

/// Page visibility state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// A lifecycle notification delivered by the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleSignal {
    /// The page's visibility state changed.
    VisibilityChanged(Visibility),
    /// The OS froze the page's task queues.
    Freeze,
    /// The OS resumed a previously frozen page.
    Resume,
    /// The page is being hidden by navigation. `persisted` is true when the
    /// page is kept in the history cache.
    PageHide { persisted: bool },
    /// The page is being shown. `persisted` is true for a history-cache
    /// restore.
    PageShow { persisted: bool },
}

impl LifecycleSignal {
    pub fn kind(self) -> LifecycleKind {
        match self {
            Self::VisibilityChanged(_) => LifecycleKind::Visibility,
            Self::Freeze | Self::Resume => LifecycleKind::FreezeResume,
            Self::PageHide { .. } | Self::PageShow { .. } => LifecycleKind::PageTransition,
        }
    }
}

/// Independently observable groups of lifecycle signals.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleKind {
    Visibility,
    FreezeResume,
    PageTransition,
}

/// Host features resolved once when the subscription is built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleCapabilities {
    /// Whether the host delivers OS freeze/resume notifications.
    pub freeze_resume: bool,
}

impl Default for LifecycleCapabilities {
    fn default() -> Self {
        Self {
            freeze_resume: true,
        }
    }
}

/// Set of lifecycle signal groups the subscription currently reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleObservers {
    capabilities: LifecycleCapabilities,
    visibility: bool,
    freeze_resume: bool,
    page_transition: bool,
}

impl LifecycleObservers {
    /// Observes every group the host supports.
    pub fn all(capabilities: LifecycleCapabilities) -> Self {
        Self {
            capabilities,
            visibility: true,
            freeze_resume: capabilities.freeze_resume,
            page_transition: true,
        }
    }

    /// Starts observing `kind`. Returns false if the host cannot deliver it.
    pub fn observe(&mut self, kind: LifecycleKind) -> bool {
        match kind {
            LifecycleKind::Visibility => self.visibility = true,
            LifecycleKind::FreezeResume => {
                if !self.capabilities.freeze_resume {
                    return false;
                }
                self.freeze_resume = true;
            }
            LifecycleKind::PageTransition => self.page_transition = true,
        }
        true
    }

    pub fn unobserve(&mut self, kind: LifecycleKind) {
        match kind {
            LifecycleKind::Visibility => self.visibility = false,
            LifecycleKind::FreezeResume => self.freeze_resume = false,
            LifecycleKind::PageTransition => self.page_transition = false,
        }
    }

    pub fn is_observing(&self, kind: LifecycleKind) -> bool {
        match kind {
            LifecycleKind::Visibility => self.visibility,
            LifecycleKind::FreezeResume => self.freeze_resume,
            LifecycleKind::PageTransition => self.page_transition,
        }
    }
}

/// Which signal marks the page as backgrounded.
///
/// Touch-capable desktop-class platforms do not fire page-hide reliably around
/// app switching, so visibility is used there instead and page-hide is ignored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackgroundingPolicy {
    /// Page-hide without history caching disconnects; hidden visibility is
    /// left to the transport's own idle handling.
    #[default]
    PageLifecycle,
    /// Hidden visibility disconnects immediately; page-hide is ignored.
    VisibilityOnly,
}

impl BackgroundingPolicy {
    /// Detects the policy from the host's user agent and touch point count.
    pub fn detect(user_agent: &str, max_touch_points: u32) -> Self {
        let mobile_family = ["iPad", "iPhone", "iPod"]
            .iter()
            .any(|needle| user_agent.contains(needle));
        let touch_desktop = user_agent.contains("Mac") && max_touch_points > 1;

        if mobile_family || touch_desktop {
            Self::VisibilityOnly
        } else {
            Self::PageLifecycle
        }
    }

    pub fn is_visibility_only(self) -> bool {
        matches!(self, Self::VisibilityOnly)
    }
}

/// What the subscription should do in response to a lifecycle signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleAction {
    Ignore,
    Disconnect,
    /// Reconnect when neither paused nor connected.
    ReconnectIfIdle,
    /// Reconnect when not paused, even if a connection looks alive.
    ReconnectUnlessPaused,
}

pub fn lifecycle_action(signal: LifecycleSignal, policy: BackgroundingPolicy) -> LifecycleAction {
    match signal {
        LifecycleSignal::VisibilityChanged(Visibility::Visible) => LifecycleAction::ReconnectIfIdle,
        LifecycleSignal::VisibilityChanged(Visibility::Hidden) => {
            if policy.is_visibility_only() {
                LifecycleAction::Disconnect
            } else {
                LifecycleAction::Ignore
            }
        }
        LifecycleSignal::Freeze => LifecycleAction::Disconnect,
        LifecycleSignal::Resume => LifecycleAction::ReconnectUnlessPaused,
        LifecycleSignal::PageHide { persisted: false } if !policy.is_visibility_only() => {
            LifecycleAction::Disconnect
        }
        LifecycleSignal::PageHide { .. } => LifecycleAction::Ignore,
        LifecycleSignal::PageShow { persisted: true } => LifecycleAction::ReconnectIfIdle,
        LifecycleSignal::PageShow { persisted: false } => LifecycleAction::Ignore,
    }
}
