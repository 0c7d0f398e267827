pub mod config;
pub mod notify;
pub mod provider;
pub mod state;
pub mod status;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use notify::{NotificationCenter, NotificationLimits};
pub use provider::{MessageProvider, ProviderError, Subscription};
pub use status::ConnectionStatusTracker;

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
