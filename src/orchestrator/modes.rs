//! Auto-advance and auto-select toggles.
//!
//! The settings table is the single source of truth. Nothing caches the
//! values: every decision point calls [`ModeSettings::read`].

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ModesSection;
use crate::errors::{HarvestError, HarvestResult};
use crate::store::{DbHandle, HarvestDb};

const AUTO_ADVANCE_KEY: &str = "auto_advance";
const AUTO_SELECT_KEY: &str = "auto_select";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modes {
    pub auto_advance: bool,
    pub auto_select: bool,
}

impl From<ModesSection> for Modes {
    fn from(section: ModesSection) -> Self {
        Self {
            auto_advance: section.auto_advance,
            auto_select: section.auto_select,
        }
    }
}

/// Partial update; `None` leaves a toggle as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModesPatch {
    #[serde(default)]
    pub auto_advance: Option<bool>,
    #[serde(default)]
    pub auto_select: Option<bool>,
}

#[derive(Clone)]
pub struct ModeSettings {
    db: DbHandle,
    /// Used for toggles nobody has persisted yet.
    defaults: Modes,
}

impl ModeSettings {
    pub fn new(db: DbHandle, defaults: Modes) -> Self {
        Self { db, defaults }
    }

    pub async fn read(&self) -> HarvestResult<Modes> {
        let defaults = self.defaults;
        self.db
            .call(move |db| read_modes(db, defaults))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    pub async fn update(&self, patch: ModesPatch) -> HarvestResult<Modes> {
        let defaults = self.defaults;
        self.db
            .call(move |db| {
                if let Some(on) = patch.auto_advance {
                    db.set_setting(AUTO_ADVANCE_KEY, &on.to_string())?;
                }
                if let Some(on) = patch.auto_select {
                    db.set_setting(AUTO_SELECT_KEY, &on.to_string())?;
                }
                read_modes(db, defaults)
            })
            .await
            .map_err(HarvestError::from_anyhow)
    }
}

fn read_modes(db: &HarvestDb, defaults: Modes) -> anyhow::Result<Modes> {
    Ok(Modes {
        auto_advance: read_flag(db, AUTO_ADVANCE_KEY, defaults.auto_advance)?,
        auto_select: read_flag(db, AUTO_SELECT_KEY, defaults.auto_select)?,
    })
}

fn read_flag(db: &HarvestDb, key: &str, default: bool) -> anyhow::Result<bool> {
    Ok(match db.get_setting(key)?.as_deref() {
        None => default,
        Some("true") => true,
        Some("false") => false,
        Some(other) => {
            warn!(key, value = other, "unrecognised mode value, using default");
            default
        }
    })
}
