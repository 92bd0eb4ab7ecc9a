//! In-memory scene stacks and the per-pixel parallel drivers.
//!
//! A [`SeriesProvider`] hands out one pixel's time series at a time; the
//! drivers map every pixel in parallel and scatter the results back into
//! per-target (or per-scene) rasters. Pixels never share state.

use std::collections::BTreeMap;

use ndarray::Array2;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use tracing::debug;

use crate::cloud_filter::{cloud_temporal_filter, CloudFilterParams, CloudFilterRecord};
use crate::model::PredictionRecord;
use crate::phenology::{fit_targets, PhenologyParams};
use crate::series::TimeSeries;
use crate::PhenoError;

pub const PHENOLOGY_BANDS: [&str; 10] = [
    "median",
    "time",
    "prediction_filtered",
    "clear_images",
    "window_size",
    "min",
    "max",
    "stdev",
    "linear_coef",
    "quadratic_coef",
];

pub const CLOUD_FILTER_BANDS: [&str; 6] = [
    "reg_diff",
    "reg_expected",
    "previous",
    "previous_DOY",
    "next",
    "next_DOY",
];

/// Source of per-pixel series. Implementations must be shareable across the
/// worker pool.
pub trait SeriesProvider: Sync {
    /// Raster `(rows, cols)`.
    fn shape(&self) -> (usize, usize);

    /// Number of scenes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn series(&self, row: usize, col: usize, band: &str) -> Result<TimeSeries, PhenoError>;
}

/// One dated acquisition: named bands on a shared grid plus a validity mask.
#[derive(Clone, Debug, PartialEq)]
pub struct Scene {
    pub id: String,
    pub time: f64,
    pub bands: BTreeMap<String, Array2<f64>>,
    pub mask: Array2<bool>,
}

impl Scene {
    pub fn new(id: impl Into<String>, time: f64, mask: Array2<bool>) -> Self {
        Self {
            id: id.into(),
            time,
            bands: BTreeMap::new(),
            mask,
        }
    }

    pub fn with_band(mut self, name: impl Into<String>, data: Array2<f64>) -> Self {
        self.bands.insert(name.into(), data);
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn band(&self, name: &str) -> Result<&Array2<f64>, PhenoError> {
        self.bands
            .get(name)
            .ok_or_else(|| PhenoError::MissingBand(format!("{} (scene {})", name, self.id)))
    }
}

/// Scenes sharing one grid, ordered by time.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneStack {
    scenes: Vec<Scene>,
    shape: (usize, usize),
}

impl SceneStack {
    /// Validate grid shapes and sort scenes by time. Scenes sharing a
    /// timestamp keep their input order.
    pub fn new(mut scenes: Vec<Scene>) -> Result<Self, PhenoError> {
        let shape = scenes.first().ok_or(PhenoError::EmptyStack)?.shape();
        for scene in &scenes {
            if !scene.time.is_finite() {
                return Err(PhenoError::InvalidParameter(format!(
                    "scene {} has a non-finite time",
                    scene.id
                )));
            }
            if scene.shape() != shape {
                return Err(PhenoError::ShapeMismatch {
                    expected: format!("{:?}", shape),
                    found: format!("{:?} (mask of scene {})", scene.shape(), scene.id),
                });
            }
            for (name, band) in &scene.bands {
                if band.dim() != shape {
                    return Err(PhenoError::ShapeMismatch {
                        expected: format!("{:?}", shape),
                        found: format!("{:?} (band {} of scene {})", band.dim(), name, scene.id),
                    });
                }
            }
        }
        scenes.sort_by_key(|s| OrderedFloat(s.time));
        Ok(Self { scenes, shape })
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn into_scenes(self) -> Vec<Scene> {
        self.scenes
    }

    pub fn times(&self) -> Vec<f64> {
        self.scenes.iter().map(|s| s.time).collect()
    }
}

impl SeriesProvider for SceneStack {
    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn len(&self) -> usize {
        self.scenes.len()
    }

    fn series(&self, row: usize, col: usize, band: &str) -> Result<TimeSeries, PhenoError> {
        let (rows, cols) = self.shape;
        if row >= rows || col >= cols {
            return Err(PhenoError::InvalidParameter(format!(
                "pixel ({}, {}) outside {}x{} raster",
                row, col, rows, cols
            )));
        }
        let mut values = Vec::with_capacity(self.scenes.len());
        let mut valid = Vec::with_capacity(self.scenes.len());
        for scene in &self.scenes {
            values.push(scene.band(band)?[[row, col]]);
            valid.push(scene.mask[[row, col]]);
        }
        TimeSeries::from_columns(self.times(), values, valid)
    }
}

/// Fitted curve sample for every pixel at one target time.
#[derive(Clone, Debug, PartialEq)]
pub struct PhenologyImage {
    pub target_time: f64,
    pub median: Array2<f64>,
    pub time: Array2<f64>,
    pub prediction_filtered: Array2<f64>,
    pub clear_images: Array2<f64>,
    pub window_size: Array2<f64>,
    pub min: Array2<f64>,
    pub max: Array2<f64>,
    pub stdev: Array2<f64>,
    pub linear_coef: Array2<f64>,
    pub quadratic_coef: Array2<f64>,
}

impl PhenologyImage {
    fn empty(shape: (usize, usize), target_time: f64) -> Self {
        let nan = || Array2::from_elem(shape, f64::NAN);
        Self {
            target_time,
            median: nan(),
            time: Array2::from_elem(shape, target_time),
            prediction_filtered: nan(),
            clear_images: Array2::zeros(shape),
            window_size: Array2::zeros(shape),
            min: nan(),
            max: nan(),
            stdev: nan(),
            linear_coef: nan(),
            quadratic_coef: nan(),
        }
    }

    fn set(&mut self, row: usize, col: usize, record: &PredictionRecord) {
        let idx = [row, col];
        self.median[idx] = record.median;
        self.time[idx] = record.target_time;
        self.prediction_filtered[idx] = record.prediction;
        self.clear_images[idx] = record.unmasked_count as f64;
        self.window_size[idx] = record.observed_count as f64;
        self.min[idx] = record.min;
        self.max[idx] = record.max;
        self.stdev[idx] = record.stdev;
        self.linear_coef[idx] = record.linear_constant;
        self.quadratic_coef[idx] = record.quadratic_constant;
    }

    pub fn band(&self, name: &str) -> Option<&Array2<f64>> {
        match name {
            "median" => Some(&self.median),
            "time" => Some(&self.time),
            "prediction_filtered" => Some(&self.prediction_filtered),
            "clear_images" => Some(&self.clear_images),
            "window_size" => Some(&self.window_size),
            "min" => Some(&self.min),
            "max" => Some(&self.max),
            "stdev" => Some(&self.stdev),
            "linear_coef" => Some(&self.linear_coef),
            "quadratic_coef" => Some(&self.quadratic_coef),
            _ => None,
        }
    }
}

fn pixel_map<P, T, F>(provider: &P, f: F) -> Result<Vec<T>, PhenoError>
where
    P: SeriesProvider,
    T: Send,
    F: Fn(usize, usize) -> Result<T, PhenoError> + Sync,
{
    let (rows, cols) = provider.shape();
    (0..rows * cols)
        .into_par_iter()
        .map(|i| f(i / cols, i % cols))
        .collect()
}

/// Fit the phenology curve of every pixel. One image per target time.
pub fn fit_phenology_stack<P: SeriesProvider>(
    provider: &P,
    params: &PhenologyParams,
) -> Result<Vec<PhenologyImage>, PhenoError> {
    params.validate()?;
    let targets = params.target_times()?;
    let shape = provider.shape();
    debug!(
        rows = shape.0,
        cols = shape.1,
        scenes = provider.len(),
        targets = targets.len(),
        band = %params.band_name,
        "fitting phenology stack"
    );

    let per_pixel = pixel_map(provider, |row, col| {
        let series = provider.series(row, col, &params.band_name)?;
        Ok(fit_targets(&series, &targets, params))
    })?;

    let mut images: Vec<PhenologyImage> = targets
        .iter()
        .map(|&t| PhenologyImage::empty(shape, t))
        .collect();
    for (i, records) in per_pixel.iter().enumerate() {
        let (row, col) = (i / shape.1, i % shape.1);
        for (image, record) in images.iter_mut().zip(records) {
            image.set(row, col, record);
        }
    }
    Ok(images)
}

/// Run the temporal cloud filter on every pixel. Returns the stack with
/// updated masks and the diagnostic bands added to each scene.
pub fn cloud_filter_stack(stack: &SceneStack, params: &CloudFilterParams) -> Result<SceneStack, PhenoError> {
    params.validate()?;
    let shape = stack.shape();
    let per_pixel: Vec<Vec<CloudFilterRecord>> = pixel_map(stack, |row, col| {
        let series = stack.series(row, col, &params.band_name)?;
        cloud_temporal_filter(&series, params)
    })?;

    let mut scenes = stack.scenes().to_vec();
    let mut diagnostics: Vec<[Array2<f64>; 6]> = scenes
        .iter()
        .map(|_| std::array::from_fn(|_| Array2::from_elem(shape, f64::NAN)))
        .collect();
    let mut rejected = 0usize;

    for (i, records) in per_pixel.iter().enumerate() {
        let idx = [i / shape.1, i % shape.1];
        for ((scene, bands), record) in scenes.iter_mut().zip(diagnostics.iter_mut()).zip(records) {
            scene.mask[idx] = record.observation.valid;
            rejected += record.rejected as usize;
            let values = [
                record.reg_diff,
                record.reg_expected,
                record.previous,
                record.previous_doy,
                record.next,
                record.next_doy,
            ];
            for (band, value) in bands.iter_mut().zip(values) {
                band[idx] = value;
            }
        }
    }

    for (scene, bands) in scenes.iter_mut().zip(diagnostics) {
        for (name, band) in CLOUD_FILTER_BANDS.iter().zip(bands) {
            scene.bands.insert((*name).to_string(), band);
        }
    }
    debug!(
        scenes = scenes.len(),
        rejected,
        "cloud filter applied to stack"
    );
    SceneStack::new(scenes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn scene(id: &str, time: f64, values: [f64; 2]) -> Scene {
        Scene::new(id, time, Array2::from_elem((1, 2), true))
            .with_band("NDVI", array![[values[0], values[1]]])
    }

    #[test]
    fn test_stack_is_sorted_by_time() {
        let stack = SceneStack::new(vec![
            scene("c", 10.0, [0.1, 0.2]),
            scene("a", 0.0, [0.3, 0.4]),
            scene("b", 5.0, [0.5, 0.6]),
        ])
        .unwrap();
        let ids: Vec<&str> = stack.scenes().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let series = stack.series(0, 1, "NDVI").unwrap();
        assert_eq!(series.values().to_vec(), vec![0.4, 0.6, 0.2]);
    }

    #[test]
    fn test_stack_validation() {
        assert!(matches!(SceneStack::new(Vec::new()), Err(PhenoError::EmptyStack)));
        let odd = Scene::new("odd", 3.0, Array2::from_elem((2, 2), true));
        assert!(matches!(
            SceneStack::new(vec![scene("a", 0.0, [0.1, 0.2]), odd]),
            Err(PhenoError::ShapeMismatch { .. })
        ));
        let stack = SceneStack::new(vec![scene("a", 0.0, [0.1, 0.2])]).unwrap();
        assert!(matches!(stack.series(0, 0, "EVI"), Err(PhenoError::MissingBand(_))));
        assert!(stack.series(1, 0, "NDVI").is_err());
    }

    #[test]
    fn test_cloud_filter_stack_updates_masks() {
        let stack = SceneStack::new(vec![
            scene("a", 0.0, [10.0, 10.0]),
            scene("b", 5.0, [100.0, 11.0]),
            scene("c", 10.0, [12.0, 12.0]),
        ])
        .unwrap();
        let params = CloudFilterParams {
            threshold_low: -5.0,
            threshold_high: 5.0,
            ..CloudFilterParams::default()
        };
        let filtered = cloud_filter_stack(&stack, &params).unwrap();
        let middle = &filtered.scenes()[1];
        assert!(!middle.mask[[0, 0]]);
        assert!(middle.mask[[0, 1]]);
        let expected = middle.band("reg_expected").unwrap();
        assert!((expected[[0, 0]] - 11.0).abs() < 1e-12);
        for name in CLOUD_FILTER_BANDS {
            assert!(middle.bands.contains_key(name));
        }
        assert!(filtered.scenes()[0].mask[[0, 0]]);
    }

    #[test]
    fn test_phenology_stack_has_one_image_per_target() {
        let scenes: Vec<Scene> = (0..24)
            .map(|i| {
                let t = 15.0 * i as f64;
                let v = 0.5 + 0.3 * (t / 365.0 * std::f64::consts::TAU).sin();
                scene(&format!("s{}", i), t, [v, f64::NAN])
            })
            .collect();
        let stack = SceneStack::new(scenes).unwrap();
        let params = PhenologyParams::default();
        let images = fit_phenology_stack(&stack, &params).unwrap();
        assert_eq!(images.len(), 12);
        for image in &images {
            for name in PHENOLOGY_BANDS {
                assert!(image.band(name).is_some());
            }
            assert_eq!(image.time[[0, 0]], image.target_time);
            // second pixel has no finite data
            assert!(image.prediction_filtered[[0, 1]].is_nan());
            assert_eq!(image.clear_images[[0, 1]], 0.0);
        }
        let pred = images[2].prediction_filtered[[0, 0]];
        assert!(pred.is_finite());
        assert!(images[2].clear_images[[0, 0]] >= 6.0);
    }
}
