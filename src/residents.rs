use anyhow::{Context, Result};
use facegate_oracle::ResidentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resident {
    pub id: ResidentId,
    pub name: String,
    pub apartment: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Read-only lookup of residents by id.
pub trait ResidentDirectory: Send + Sync {
    fn resolve(&self, id: &ResidentId) -> Option<Resident>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RosterFile {
    #[serde(default, rename = "resident")]
    residents: Vec<Resident>,
}

/// Resident directory backed by a `residents.toml` file of `[[resident]]`
/// tables.
#[derive(Debug, Default)]
pub struct Roster {
    residents: HashMap<ResidentId, Resident>,
}

impl Roster {
    pub fn from_residents(residents: impl IntoIterator<Item = Resident>) -> Result<Self> {
        let mut map = HashMap::new();
        for resident in residents {
            if let Some(dup) = map.insert(resident.id.clone(), resident) {
                anyhow::bail!("duplicate resident id {}", dup.id);
            }
        }
        Ok(Self { residents: map })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!("no resident roster at {}, every grant will be refused", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading residents at {}", path.display()))?;
        let file: RosterFile =
            toml::from_str(&raw).with_context(|| format!("parsing residents {}", path.display()))?;
        Self::from_residents(file.residents)
            .with_context(|| format!("loading residents {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.residents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residents.is_empty()
    }
}

impl ResidentDirectory for Roster {
    fn resolve(&self, id: &ResidentId) -> Option<Resident> {
        self.residents.get(id).cloned()
    }
}
