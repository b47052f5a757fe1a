//! The kit context every operation is reached through.

use std::sync::Arc;

use tracing::warn;

use crate::config::KitConfig;
use crate::contracts::{ClassDef, Code};
use crate::dex::Dex;
use crate::error::KitError;
use crate::ft::Ft;
use crate::nft::Nft;
use crate::runtime::RunInstance;
use crate::tokens;
use crate::types::{Location, Owner};

/// Binds a runtime instance and a configuration. Cheap to clone.
pub struct TokenKit<R: RunInstance + ?Sized> {
    run: Arc<R>,
    config: KitConfig,
}

impl<R: RunInstance + ?Sized> Clone for TokenKit<R> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            config: self.config.clone(),
        }
    }
}

impl<R: RunInstance + ?Sized> TokenKit<R> {
    pub fn new(run: Arc<R>) -> Self {
        Self::with_config(run, KitConfig::default())
    }

    pub fn with_config(run: Arc<R>, config: KitConfig) -> Self {
        if config.network != run.network() {
            warn!(
                configured = %config.network,
                runtime = %run.network(),
                "runtime network differs from configuration"
            );
        }
        Self { run, config }
    }

    pub fn run(&self) -> &Arc<R> {
        &self.run
    }

    pub fn config(&self) -> &KitConfig {
        &self.config
    }

    /// OrderLock class location on the runtime's network.
    pub fn order_lock(&self) -> Result<Location, KitError> {
        let network = self.run.network();
        self.config
            .order_lock(network)
            .ok_or(KitError::MissingOrderLockPreset(network))
    }

    pub fn ft(&self) -> Ft<'_, R> {
        Ft::new(self)
    }

    pub fn nft(&self) -> Nft<'_, R> {
        Nft::new(self)
    }

    pub fn dex(&self) -> Dex<'_, R> {
        Dex::new(self)
    }

    pub fn util(&self) -> Util<'_, R> {
        Util { kit: self }
    }
}

/// Class maintenance helpers.
pub struct Util<'a, R: RunInstance + ?Sized> {
    kit: &'a TokenKit<R>,
}

impl<'a, R: RunInstance + ?Sized> Util<'a, R> {
    /// See [`tokens::upgrade_class`].
    pub async fn upgrade_class(
        &self,
        origin: &Location,
        new_class: ClassDef,
        updated: &[String],
    ) -> Result<Code, KitError> {
        tokens::upgrade_class(self.kit.run().as_ref(), origin, new_class, updated).await
    }

    pub async fn transfer_class(&self, origin: &Location, owner: impl Into<Owner>) -> Result<Code, KitError> {
        tokens::transfer_class(self.kit.run().as_ref(), origin, owner.into()).await
    }
}
