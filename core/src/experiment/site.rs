use crate::prelude::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Underground laboratory hosting a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    /// Default vertical overburden in km of rock.
    pub depth_km: f64,
    pub rock_density_g_cm3: f64,
}

impl Site {
    /// Known laboratories, keyed by the labels experiment configs use.
    pub fn lookup(name: &str) -> ConfigResult<Site> {
        let (depth_km, rock_density_g_cm3) = match name {
            // LNGS, home of XENON and DarkSide.
            "XENON" | "LNGS" => (1.4, 2.71),
            "SUF" => (0.0107, 2.7),
            "SNOLAB" => (2.0, 2.65),
            other => return Err(ConfigError::UnknownSite(other.to_string())),
        };
        Ok(Site {
            name: name.to_string(),
            depth_km,
            rock_density_g_cm3,
        })
    }

    /// Column density in km water-equivalent for an overburden of `depth_km`.
    pub fn column_kmwe(&self, depth_km: f64) -> f64 {
        depth_km * self.rock_density_g_cm3
    }
}
