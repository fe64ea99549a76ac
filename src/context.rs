/// Application-scoped access to the session for the UI layer
use crate::callback::{strip_callback_params, CallbackParams};
use crate::error::{AuthError, Result};
use crate::session::{
    AuthFlowResult, Navigator, SessionManager, SessionPhase, SessionSnapshot, SubscriptionId,
};
use crate::users::LocalUser;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The navigable location of the host (address bar, deep link, ...)
pub trait Location: Send + Sync {
    fn href(&self) -> Result<String>;

    /// Replace the current location without adding a history entry
    fn replace(&self, href: &str) -> Result<()>;
}

/// In-memory location for native hosts and tests
#[derive(Debug)]
pub struct MemoryLocation {
    href: Mutex<String>,
}

impl MemoryLocation {
    pub fn new(href: &str) -> Self {
        Self {
            href: Mutex::new(href.to_string()),
        }
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> Result<String> {
        Ok(self.href.lock().clone())
    }

    fn replace(&self, href: &str) -> Result<()> {
        *self.href.lock() = href.to_string();
        Ok(())
    }
}

type Slot = Arc<RwLock<Option<Arc<SessionManager>>>>;

/// Owns the session for the lifetime of the host
///
/// Handles given out by [`SessionContext::handle`] stop working once the
/// context is torn down or dropped.
pub struct SessionContext {
    slot: Slot,
    initialized: AtomicBool,
}

impl SessionContext {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(manager))),
            initialized: AtomicBool::new(false),
        }
    }

    /// Resolve the initial session once
    ///
    /// A location carrying `code` and `state` completes the pending sign-in;
    /// anything else runs a plain session check. Callback parameters are
    /// stripped from the location either way. Later calls return the current
    /// snapshot without doing anything.
    pub fn initialize(&self, location: &dyn Location) -> Result<SessionSnapshot> {
        let manager = self.manager()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(manager.snapshot());
        }

        let result = resolve_location(&manager, location);
        if result.is_err() && manager.phase() == SessionPhase::Uninitialized {
            // The location could not be used; settle the session anyway.
            if let Err(e) = manager.check_session() {
                tracing::warn!(error = %e, "Initial session check failed");
            }
        }
        result
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            slot: Some(self.slot.clone()),
        }
    }

    /// Release the session; outstanding handles fail from now on
    pub fn teardown(&self) {
        let manager = self.slot.write().take();
        if let Some(manager) = manager {
            manager.shutdown();
            tracing::debug!("Session context torn down");
        }
    }

    fn manager(&self) -> Result<Arc<SessionManager>> {
        self.slot.read().clone().ok_or(AuthError::ContextUnavailable)
    }
}

fn resolve_location(manager: &SessionManager, location: &dyn Location) -> Result<SessionSnapshot> {
    let href = location.href()?;
    match CallbackParams::from_url(&href) {
        Ok(Some(params)) => {
            location.replace(&strip_callback_params(&href)?)?;
            manager.resume_from_callback(&params)
        }
        Ok(None) => manager.check_session(),
        Err(e @ AuthError::AuthorizationDenied { .. }) => {
            tracing::warn!(error = %e, "Provider declined the sign-in");
            location.replace(&strip_callback_params(&href)?)?;
            manager.check_session()?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cloneable consumer view of a [`SessionContext`]
#[derive(Clone, Default)]
pub struct SessionHandle {
    slot: Option<Slot>,
}

impl SessionHandle {
    /// A handle with no context behind it
    pub fn detached() -> Self {
        Self { slot: None }
    }

    fn manager(&self) -> Result<Arc<SessionManager>> {
        self.slot
            .as_ref()
            .and_then(|slot| slot.read().clone())
            .ok_or(AuthError::ContextUnavailable)
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        Ok(self.manager()?.snapshot())
    }

    pub fn user(&self) -> Result<Option<LocalUser>> {
        Ok(self.manager()?.user())
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.manager()?.is_authenticated())
    }

    pub fn is_loading(&self) -> Result<bool> {
        Ok(self.manager()?.is_loading())
    }

    pub fn begin_login(&self) -> Result<AuthFlowResult> {
        self.manager()?.begin_login()
    }

    pub fn login(&self, navigator: &dyn Navigator) -> Result<AuthFlowResult> {
        self.manager()?.login(navigator)
    }

    pub fn logout(&self) -> Result<SessionSnapshot> {
        Ok(self.manager()?.logout())
    }

    pub fn handle_auth_callback(&self, code: &str, state: &str) -> Result<SessionSnapshot> {
        self.manager()?.handle_auth_callback(code, state)
    }

    pub fn subscribe<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        Ok(self.manager()?.subscribe(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        Ok(self.manager()?.unsubscribe(id))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("attached", &self.manager().is_ok())
            .finish()
    }
}
