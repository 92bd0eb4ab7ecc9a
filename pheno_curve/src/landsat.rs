//! Landsat Collection-2 Level-2 band arithmetic: QA cloud masks, scale factors,
//! vegetation indices and auxiliary time bands.
//!
//! Band names follow the USGS product (`SR_B*`, `ST_B*`, `QA_PIXEL`). Landsat
//! 4/5/7 (TM/ETM+) and 8/9 (OLI) number their spectral bands differently,
//! which [`Sensor`] accounts for.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::raster::Scene;
use crate::time::{day_of_year, decimal_year};
use crate::PhenoError;

pub const QA_BAND: &str = "QA_PIXEL";
pub const DOY_BAND: &str = "DOY";
pub const TIME_BAND: &str = "time";

const DILATED_CLOUD: u16 = 1 << 1;
const CIRRUS: u16 = 1 << 2;
const CLOUD: u16 = 1 << 3;
const CLOUD_SHADOW: u16 = 1 << 4;

const SR_SCALE: f64 = 0.0000275;
const SR_OFFSET: f64 = -0.2;
const ST_SCALE: f64 = 0.00341802;
const ST_OFFSET: f64 = 149.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sensor {
    /// Landsat 4, 5 and 7.
    Tm457,
    /// Landsat 8 and 9.
    Oli89,
}

/// Native names of the bands used by the indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpectralBands {
    pub blue: &'static str,
    pub red: &'static str,
    pub nir: &'static str,
    pub swir1: &'static str,
    pub swir2: &'static str,
}

impl Sensor {
    pub fn bands(&self) -> SpectralBands {
        match self {
            Sensor::Tm457 => SpectralBands {
                blue: "SR_B1",
                red: "SR_B3",
                nir: "SR_B4",
                swir1: "SR_B5",
                swir2: "SR_B7",
            },
            Sensor::Oli89 => SpectralBands {
                blue: "SR_B2",
                red: "SR_B4",
                nir: "SR_B5",
                swir1: "SR_B6",
                swir2: "SR_B7",
            },
        }
    }

    /// QA_PIXEL bits that mark a pixel as contaminated.
    pub fn cloud_bits(&self) -> u16 {
        match self {
            Sensor::Tm457 => DILATED_CLOUD | CLOUD | CLOUD_SHADOW,
            Sensor::Oli89 => DILATED_CLOUD | CIRRUS | CLOUD | CLOUD_SHADOW,
        }
    }

    pub fn is_clear(&self, qa: u16) -> bool {
        qa & self.cloud_bits() == 0
    }

    /// Renames onto the Landsat 5 band numbering shared by all sensors.
    fn common_band_names(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Sensor::Tm457 => &[
                ("SR_B1", "SR_B1"),
                ("SR_B2", "SR_B2"),
                ("SR_B3", "SR_B3"),
                ("SR_B4", "SR_B4"),
                ("SR_B5", "SR_B5"),
                ("SR_B7", "SR_B7"),
                ("ST_B6", "ST"),
            ],
            Sensor::Oli89 => &[
                ("SR_B2", "SR_B1"),
                ("SR_B3", "SR_B2"),
                ("SR_B4", "SR_B3"),
                ("SR_B5", "SR_B4"),
                ("SR_B6", "SR_B5"),
                ("SR_B7", "SR_B7"),
                ("ST_B10", "ST"),
            ],
        }
    }
}

/// Clear-sky mask from the QA band. With `mask_clouds` off the QA bits are
/// ignored and only the existing mask and finite QA values count.
pub fn cloud_mask(scene: &Scene, sensor: Sensor, mask_clouds: bool) -> Result<Array2<bool>, PhenoError> {
    let qa = scene.band(QA_BAND)?;
    Ok(Zip::from(&scene.mask).and(qa).map_collect(|&ok, &q| {
        ok && q.is_finite() && (!mask_clouds || sensor.is_clear(q as u16))
    }))
}

pub fn apply_cloud_mask(scene: &mut Scene, sensor: Sensor, mask_clouds: bool) -> Result<(), PhenoError> {
    scene.mask = cloud_mask(scene, sensor, mask_clouds)?;
    Ok(())
}

pub fn scale_reflectance(dn: f64) -> f64 {
    dn * SR_SCALE + SR_OFFSET
}

pub fn scale_temperature(dn: f64) -> f64 {
    dn * ST_SCALE + ST_OFFSET
}

/// Convert digital numbers of every `SR_B*` and `ST_B*` band to reflectance
/// and kelvin in place.
pub fn rescale(scene: &mut Scene) {
    for (name, band) in scene.bands.iter_mut() {
        if name.starts_with("SR_B") {
            band.mapv_inplace(scale_reflectance);
        } else if name.starts_with("ST_B") {
            band.mapv_inplace(scale_temperature);
        }
    }
}

/// Keep only the bands common to all sensors, renamed to the Landsat 5
/// numbering. The coastal band and QA band are dropped, so mask first.
pub fn harmonize_band_names(scene: &mut Scene, sensor: Sensor) {
    let mut bands = std::mem::take(&mut scene.bands);
    for (from, to) in sensor.common_band_names() {
        if let Some(band) = bands.remove(*from) {
            scene.bands.insert((*to).to_string(), band);
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VegetationIndex {
    #[serde(rename = "NDVI")]
    Ndvi,
    #[serde(rename = "EVI")]
    Evi,
    #[serde(rename = "NIRv")]
    Nirv,
    #[serde(rename = "SAVI")]
    Savi,
    #[serde(rename = "NDSVI")]
    Ndsvi,
}

impl VegetationIndex {
    pub fn name(&self) -> &'static str {
        match self {
            VegetationIndex::Ndvi => "NDVI",
            VegetationIndex::Evi => "EVI",
            VegetationIndex::Nirv => "NIRv",
            VegetationIndex::Savi => "SAVI",
            VegetationIndex::Ndsvi => "NDSVI",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ndvi" => Some(VegetationIndex::Ndvi),
            "evi" => Some(VegetationIndex::Evi),
            "nirv" => Some(VegetationIndex::Nirv),
            "savi" => Some(VegetationIndex::Savi),
            "ndsvi" => Some(VegetationIndex::Ndsvi),
            _ => None,
        }
    }
}

pub fn ndvi(nir: f64, red: f64) -> f64 {
    (nir - red) / (nir + red)
}

pub fn evi(nir: f64, red: f64, blue: f64) -> f64 {
    2.5 * (nir - red) / (nir + 6.0 * red - 7.5 * blue + 1.0)
}

pub fn nirv(nir: f64, red: f64) -> f64 {
    ndvi(nir, red) * nir
}

pub fn savi(nir: f64, red: f64) -> f64 {
    1.5 * (nir - red) / (0.5 + nir + red)
}

pub fn ndsvi(nir: f64, red: f64, swir1: f64, swir2: f64) -> f64 {
    (1.0 - swir2 / swir1) * red / nir
}

/// Compute `index` from the scene's native bands and store it under its name.
pub fn add_index(scene: &mut Scene, sensor: Sensor, index: VegetationIndex) -> Result<(), PhenoError> {
    let b = sensor.bands();
    let nir = scene.band(b.nir)?;
    let red = scene.band(b.red)?;
    let out = match index {
        VegetationIndex::Ndvi => Zip::from(nir).and(red).map_collect(|&n, &r| ndvi(n, r)),
        VegetationIndex::Nirv => Zip::from(nir).and(red).map_collect(|&n, &r| nirv(n, r)),
        VegetationIndex::Savi => Zip::from(nir).and(red).map_collect(|&n, &r| savi(n, r)),
        VegetationIndex::Evi => {
            let blue = scene.band(b.blue)?;
            Zip::from(nir)
                .and(red)
                .and(blue)
                .map_collect(|&n, &r, &bl| evi(n, r, bl))
        }
        VegetationIndex::Ndsvi => {
            let swir1 = scene.band(b.swir1)?;
            let swir2 = scene.band(b.swir2)?;
            Zip::from(nir)
                .and(red)
                .and(swir1)
                .and(swir2)
                .map_collect(|&n, &r, &s1, &s2| ndsvi(n, r, s1, s2))
        }
    };
    scene.bands.insert(index.name().to_string(), out);
    Ok(())
}

/// Add a constant `DOY` band; `scene.time` is days since 1970-01-01.
pub fn add_doy(scene: &mut Scene) {
    let doy = day_of_year(scene.time);
    scene
        .bands
        .insert(DOY_BAND.to_string(), Array2::from_elem(scene.shape(), doy));
}

/// Add a constant `time` band in decimal years.
pub fn add_time(scene: &mut Scene) {
    let years = decimal_year(scene.time);
    scene
        .bands
        .insert(TIME_BAND.to_string(), Array2::from_elem(scene.shape(), years));
}

/// Copy of `scene` placed on the day-of-year axis.
pub fn to_day_of_year(scene: &Scene) -> Scene {
    Scene {
        time: day_of_year(scene.time),
        ..scene.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DAYS_PER_YEAR;
    use ndarray::array;

    fn scene_with(bands: &[(&str, f64)]) -> Scene {
        bands.iter().fold(
            Scene::new("LC08_test", 18_000.0, Array2::from_elem((1, 1), true)),
            |scene, &(name, v)| scene.with_band(name, array![[v]]),
        )
    }

    #[test]
    fn test_cirrus_only_masks_oli() {
        let qa = CIRRUS;
        assert!(Sensor::Tm457.is_clear(qa));
        assert!(!Sensor::Oli89.is_clear(qa));
        assert!(!Sensor::Tm457.is_clear(CLOUD_SHADOW | 1));
        assert!(Sensor::Oli89.is_clear(1 << 6));
    }

    #[test]
    fn test_cloud_mask_toggle() {
        let mut scene = scene_with(&[(QA_BAND, CLOUD as f64)]);
        assert!(!cloud_mask(&scene, Sensor::Oli89, true).unwrap()[[0, 0]]);
        assert!(cloud_mask(&scene, Sensor::Oli89, false).unwrap()[[0, 0]]);
        apply_cloud_mask(&mut scene, Sensor::Tm457, true).unwrap();
        assert!(!scene.mask[[0, 0]]);
        let bare = scene_with(&[]);
        assert!(matches!(
            cloud_mask(&bare, Sensor::Tm457, true),
            Err(PhenoError::MissingBand(_))
        ));
    }

    #[test]
    fn test_rescale_scale_factors() {
        let mut scene = scene_with(&[("SR_B4", 10_000.0), ("ST_B10", 40_000.0), (QA_BAND, 21_824.0)]);
        rescale(&mut scene);
        assert!((scene.band("SR_B4").unwrap()[[0, 0]] - 0.075).abs() < 1e-12);
        assert!((scene.band("ST_B10").unwrap()[[0, 0]] - 285.7208).abs() < 1e-9);
        assert_eq!(scene.band(QA_BAND).unwrap()[[0, 0]], 21_824.0);
    }

    #[test]
    fn test_index_formulas() {
        assert!((ndvi(0.5, 0.1) - 0.4 / 0.6).abs() < 1e-12);
        assert!((evi(0.5, 0.1, 0.05) - 2.5 * 0.4 / (0.5 + 0.6 - 0.375 + 1.0)).abs() < 1e-12);
        assert!((nirv(0.5, 0.1) - 0.5 * 0.4 / 0.6).abs() < 1e-12);
        assert!((savi(0.5, 0.1) - 1.5 * 0.4 / 1.1).abs() < 1e-12);
        assert!((ndsvi(0.5, 0.1, 0.3, 0.15) - 0.5 * 0.1 / 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_add_index_uses_sensor_band_numbering() {
        let mut oli = scene_with(&[("SR_B5", 0.5), ("SR_B4", 0.1), ("SR_B2", 0.05)]);
        add_index(&mut oli, Sensor::Oli89, VegetationIndex::Ndvi).unwrap();
        add_index(&mut oli, Sensor::Oli89, VegetationIndex::Evi).unwrap();
        assert!((oli.band("NDVI").unwrap()[[0, 0]] - ndvi(0.5, 0.1)).abs() < 1e-12);
        assert!((oli.band("EVI").unwrap()[[0, 0]] - evi(0.5, 0.1, 0.05)).abs() < 1e-12);

        let mut tm = scene_with(&[("SR_B4", 0.5), ("SR_B3", 0.1)]);
        add_index(&mut tm, Sensor::Tm457, VegetationIndex::Savi).unwrap();
        assert!(tm.bands.contains_key("SAVI"));
        assert!(add_index(&mut tm, Sensor::Tm457, VegetationIndex::Ndsvi).is_err());
    }

    #[test]
    fn test_time_bands() {
        let mut scene = scene_with(&[]);
        scene.time = 50.0 * DAYS_PER_YEAR + 100.0;
        add_doy(&mut scene);
        add_time(&mut scene);
        assert!((scene.band(DOY_BAND).unwrap()[[0, 0]] - 100.0).abs() < 1e-9);
        assert!((scene.band(TIME_BAND).unwrap()[[0, 0]] - (2020.0 + 100.0 / DAYS_PER_YEAR)).abs() < 1e-9);
        assert!((to_day_of_year(&scene).time - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_harmonize_oli_names() {
        let mut scene = scene_with(&[("SR_B1", 0.01), ("SR_B5", 0.4), ("ST_B10", 290.0), (QA_BAND, 0.0)]);
        harmonize_band_names(&mut scene, Sensor::Oli89);
        assert_eq!(scene.band("SR_B4").unwrap()[[0, 0]], 0.4);
        assert_eq!(scene.band("ST").unwrap()[[0, 0]], 290.0);
        assert!(scene.band("SR_B1").is_err());
        assert!(scene.band(QA_BAND).is_err());
        assert_eq!(VegetationIndex::parse("nirv"), Some(VegetationIndex::Nirv));
    }
}
