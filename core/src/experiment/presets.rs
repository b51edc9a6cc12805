use crate::experiment::config::{
    Background, Binning, ExperimentConfig, ObservedData, Resolution, Target,
};
use crate::prelude::{ConfigError, ConfigResult};

/// Every name accepted by [`preset`].
pub const PRESET_NAMES: [&str; 14] = [
    "Xe",
    "Xe_bg",
    "Ge",
    "Ge_bg",
    "Ar",
    "Ar_bg",
    "Xe_migd",
    "Xe_migd_bg",
    "Ge_migd",
    "Ge_migd_bg",
    "Ar_migd",
    "Ar_migd_bg",
    "Ge_migd_iZIP_Ge_bg",
    "Ge_migd_HV_bg",
];

// kg day keV -> tonne year keV
const PER_KG_DAY: f64 = 1.0e3 * 365.25;
// kg year keV -> tonne year keV
const PER_KG_YEAR: f64 = 1.0e3;

// SuperCDMS SNOLAB phonon resolution, 10 eV.
const SUPERCDMS_SIGMA_KEV: f64 = 0.01;

/// Build a named detector configuration.
///
/// Detectors defined with their background (`Xe_migd_bg` and the SuperCDMS
/// SNOLAB towers) are looked up by full name. Any other `_bg` name is the
/// base detector with its background model kept; without the suffix the
/// background is switched off.
pub fn preset(name: &str) -> ConfigResult<ExperimentConfig> {
    if let Some(mut config) = background_detector(name) {
        config.name = name.to_string();
        return Ok(config);
    }

    let (base, with_background) = match name.strip_suffix("_bg") {
        Some(base) => (base, true),
        None => (name, false),
    };

    let mut config = match base {
        "Xe" => standard(Target::Xe, 5.0, 0.8, 0.5, 10.0, Resolution::SqrtScaled { coefficient: 0.6 }),
        "Ge" => standard(
            Target::Ge,
            3.0,
            0.8,
            0.9,
            10.0,
            Resolution::Quadrature {
                constant: 0.3,
                slope: 0.06,
            },
        ),
        "Ar" => standard(Target::Ar, 10.0, 0.8, 0.8, 30.0, Resolution::SqrtScaled { coefficient: 0.7 }),
        "Xe_migd" => ExperimentConfig {
            location: Some("XENON".into()),
            background: Background::Flat { rate: 8.0 },
            ..low_threshold(Target::Xe, 25.0, 0.8, 0.5, 1.4, 10.0, Resolution::SqrtScaled { coefficient: 0.6 })
        },
        "Ge_migd" => ExperimentConfig {
            location: Some("SUF".into()),
            background: Background::Piecewise {
                breaks_kev: vec![3.0, 5.0],
                rates: vec![0.9 * PER_KG_DAY, 0.1 * PER_KG_DAY, 0.01 * PER_KG_DAY],
            },
            ..low_threshold(
                Target::Ge,
                0.1,
                0.8,
                0.9,
                0.07,
                5.0,
                Resolution::Polynomial {
                    noise: 0.01,
                    linear: 0.85e-3,
                    quadratic: 5.0e-3,
                },
            )
        },
        "Ar_migd" => ExperimentConfig {
            location: Some("XENON".into()),
            background: Background::Flat { rate: 8.0e4 },
            ..low_threshold(Target::Ar, 50.0, 0.8, 0.8, 3.0, 10.0, Resolution::SqrtScaled { coefficient: 0.7 })
        },
        _ => return Err(ConfigError::UnknownPreset(name.to_string())),
    };

    config.name = name.to_string();
    if !with_background {
        config.background = Background::None;
    }
    Ok(config)
}

/// Detectors that only exist with their background model.
fn background_detector(name: &str) -> Option<ExperimentConfig> {
    let config = match name {
        // Electron-recoil search: no nuclear-recoil acceptance, lower threshold.
        "Xe_migd_bg" => ExperimentConfig {
            location: Some("XENON".into()),
            background: Background::Flat { rate: 8.0 },
            ..low_threshold(Target::Xe, 25.0, 0.8, 1.0, 1.0, 10.0, Resolution::SqrtScaled { coefficient: 0.6 })
        },
        // Tritium-dominated flat background below 20 keV.
        "Ge_migd_iZIP_Ge_bg" => ExperimentConfig {
            location: Some("SNOLAB".into()),
            background: Background::Flat {
                rate: 22.0 * PER_KG_YEAR,
            },
            ..low_threshold(
                Target::Ge,
                0.056,
                0.75,
                0.5,
                0.35,
                5.0,
                Resolution::Constant {
                    sigma: SUPERCDMS_SIGMA_KEV,
                },
            )
        },
        // 32Si-dominated flat background below 20 keV.
        "Ge_migd_HV_bg" => ExperimentConfig {
            location: Some("SNOLAB".into()),
            background: Background::Flat {
                rate: 27.0 * PER_KG_YEAR,
            },
            ..low_threshold(
                Target::Ge,
                0.044,
                0.85,
                0.5,
                0.1,
                5.0,
                Resolution::Constant {
                    sigma: SUPERCDMS_SIGMA_KEV,
                },
            )
        },
        _ => return None,
    };
    Some(config)
}

fn standard(
    target: Target,
    exposure: f64,
    cut: f64,
    nr: f64,
    threshold: f64,
    resolution: Resolution,
) -> ExperimentConfig {
    ExperimentConfig {
        name: String::new(),
        target,
        exposure_tonne_year: exposure,
        cut_efficiency: cut,
        nr_efficiency: nr,
        threshold_kev: threshold,
        binning: Binning {
            e_min_kev: 0.0,
            e_max_kev: 100.0,
            n_bins: 10,
        },
        rebin_factor: 10,
        resolution,
        background: Background::None,
        location: None,
        depth_km: None,
        data: ObservedData::default(),
    }
}

fn low_threshold(
    target: Target,
    exposure: f64,
    cut: f64,
    nr: f64,
    threshold: f64,
    e_max: f64,
    resolution: Resolution,
) -> ExperimentConfig {
    ExperimentConfig {
        binning: Binning {
            e_min_kev: 0.0,
            e_max_kev: e_max,
            n_bins: 10,
        },
        ..standard(target, exposure, cut, nr, threshold, resolution)
    }
}
