//! Lifetime-bounded memoized wrappers.
//!
//! [`Vault::scoped`] opens a scope; tasks bound inside it behave as
//! memoized versions of their functions for as long as the scope lives.
//! Dropping the scope flips a shared flag, and every wrapper checks the
//! flag before doing anything, so a wrapper that escapes its scope fails
//! fast instead of quietly writing to the cache.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::{CallConfig, TaskError, Vault, VaultError};
use crate::value::{Args, Value};

impl Vault {
    /// Open an acquisition scope. All tasks bound in it share `config`.
    pub fn scoped(&self, config: CallConfig) -> Scope<'_> {
        Scope {
            vault: self,
            config,
            active: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// An acquisition scope for memoized tasks.
pub struct Scope<'v> {
    vault: &'v Vault,
    config: CallConfig,
    active: Arc<AtomicBool>,
}

impl<'v> Scope<'v> {
    /// Bind a synchronous function into the scope.
    pub fn bind<F>(&self, func_name: impl Into<String>, func: F) -> ScopedTask<'v, F>
    where
        F: Fn(&Args) -> Result<Value, TaskError>,
    {
        ScopedTask {
            vault: self.vault,
            func_name: func_name.into(),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            func,
        }
    }

    /// Bind an async function into the scope.
    pub fn bind_async<F>(&self, func_name: impl Into<String>, func: F) -> ScopedAsyncTask<'v, F> {
        ScopedAsyncTask {
            vault: self.vault,
            func_name: func_name.into(),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            func,
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Memoized wrapper produced by [`Scope::bind`]. May outlive its scope,
/// but invocation after the scope ends fails with
/// [`VaultError::ScopeExpired`].
pub struct ScopedTask<'v, F> {
    vault: &'v Vault,
    func_name: String,
    config: CallConfig,
    active: Arc<AtomicBool>,
    func: F,
}

impl<F> ScopedTask<'_, F>
where
    F: Fn(&Args) -> Result<Value, TaskError>,
{
    pub fn call(&self, args: &Args) -> Result<Value, VaultError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(VaultError::ScopeExpired(self.func_name.clone()));
        }
        self.vault
            .invoke(&self.func_name, args, &self.config, |a| (self.func)(a))
    }
}

/// Async counterpart of [`ScopedTask`].
pub struct ScopedAsyncTask<'v, F> {
    vault: &'v Vault,
    func_name: String,
    config: CallConfig,
    active: Arc<AtomicBool>,
    func: F,
}

impl<F> ScopedAsyncTask<'_, F> {
    pub async fn call<Fut>(&self, args: Args) -> Result<Value, VaultError>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        if !self.active.load(Ordering::Acquire) {
            return Err(VaultError::ScopeExpired(self.func_name.clone()));
        }
        self.vault
            .invoke_async(&self.func_name, args, &self.config, |a| (self.func)(a))
            .await
    }
}
