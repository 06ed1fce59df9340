//! Churn-adaptive replication factor.
//!
//! Every tick the predictor records how many peers left the routing table
//! since the previous tick, smooths the series with an exponential moving
//! average and predicts the departures of the next interval as
//! `floor(ema + standard deviation)`. The replication factor is then the
//! smallest `f` for which the chance that all `f` replica holders are among
//! the predicted departures stays below `1 - reliability`.
//!
//! The smoothing factor is not fixed. Each tick tries every window length
//! from the whole history down to 3 samples, fits a linear regression of the
//! observations against the averages, and uses `alpha = 2 / (len + 1)` for
//! the length with the best R².

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use kadmesh_dht::{PeerMap, PeerMapChangeListener, RemovalReason};
use kadmesh_types::{Id, PeerAddress};
use tracing::{debug, trace};

use crate::factor::ReplicationFactor;
use crate::{
    ReplicationError, Result, DEFAULT_MAX_FACTOR, DEFAULT_MIN_FACTOR,
    DEFAULT_OBSERVATION_LENGTH, DEFAULT_RELIABILITY,
};

/// Shortest window considered by the smoothing factor search. Two points
/// always fit a line perfectly.
const MIN_REGRESSION_WINDOW: usize = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Predictor parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoReplicationConfig {
    /// Target probability that at least one replica survives the predicted
    /// departures.
    pub reliability: f64,
    pub min_factor: usize,
    pub max_factor: usize,
    /// Observations kept in the sliding window.
    pub observation_length: usize,
}

impl Default for AutoReplicationConfig {
    fn default() -> Self {
        Self {
            reliability: DEFAULT_RELIABILITY,
            min_factor: DEFAULT_MIN_FACTOR,
            max_factor: DEFAULT_MAX_FACTOR,
            observation_length: DEFAULT_OBSERVATION_LENGTH,
        }
    }
}

impl AutoReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(ReplicationError::InvalidConfig(format!(
                "reliability {} outside [0, 1]",
                self.reliability
            )));
        }
        if self.min_factor == 0 || self.min_factor > self.max_factor {
            return Err(ReplicationError::InvalidConfig(format!(
                "factor bounds {}..{} are empty",
                self.min_factor, self.max_factor
            )));
        }
        if self.observation_length == 0 {
            return Err(ReplicationError::InvalidConfig(
                "observation length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smallest factor in `[min, max)` such that
/// `1 - prod_{i<f} (m - i) / (n - i) >= r`, or `max` if there is none.
///
/// `m` is the predicted number of departures, `n` the number of known peers.
pub fn replication_factor(m: usize, n: usize, r: f64, min: usize, max: usize) -> usize {
    for f in min..max {
        let mut p = 1.0;
        for i in 0..f {
            if m <= i {
                p = 0.0;
                break;
            }
            if n <= i {
                p = 1.0;
                break;
            }
            p *= (m - i) as f64 / (n - i) as f64;
        }
        if 1.0 - p >= r {
            return f;
        }
    }
    max
}

/// R² of a least-squares fit of `y` on `x`, using the last `len` samples.
/// `None` when either series has no variance or the window is empty.
fn regression_r2(x: &[f64], y: &[f64], len: usize) -> Option<f64> {
    let len = len.min(x.len()).min(y.len());
    if len == 0 {
        return None;
    }
    let x = &x[x.len() - len..];
    let y = &y[y.len() - len..];
    let n = len as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;

    let mut xx = 0.0;
    let mut yy = 0.0;
    let mut xy = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        xx += (xi - x_mean) * (xi - x_mean);
        yy += (yi - y_mean) * (yi - y_mean);
        xy += (xi - x_mean) * (yi - y_mean);
    }
    if xx == 0.0 || yy == 0.0 {
        return None;
    }
    let slope = xy / xx;
    let intercept = y_mean - slope * x_mean;
    let explained: f64 = x
        .iter()
        .map(|xi| {
            let fit = slope * xi + intercept;
            (fit - y_mean) * (fit - y_mean)
        })
        .sum();
    Some(explained / yy)
}

/// R² of a linear regression over the last `len` samples; 0 for degenerate
/// windows.
pub fn linear_regression(x: &[f64], y: &[f64], len: usize) -> f64 {
    regression_r2(x, y, len).unwrap_or(0.0)
}

/// `2 / (len + 1)` for the window length whose regression fits best. Ties
/// go to the shorter window. With fewer than 3 samples, or no usable
/// window, the whole history is used.
pub fn best_smoothing_factor(observations: &[f64], averages: &[f64]) -> f64 {
    let size = observations.len().min(averages.len());
    let mut best = 0.0;
    let mut interval = size;
    for len in (MIN_REGRESSION_WINDOW..=size).rev() {
        if let Some(r2) = regression_r2(observations, averages, len) {
            if r2 >= best {
                best = r2;
                interval = len;
            }
        }
    }
    2.0 / (interval as f64 + 1.0)
}

/// Next moving average: `last + alpha * (observed - last)`.
///
/// `averages[i]` is the average before `observations[i]` was folded in, so
/// both slices have the same length.
pub fn ema(observations: &[f64], averages: &[f64]) -> f64 {
    let alpha = best_smoothing_factor(observations, averages);
    let observed = observations.last().copied().unwrap_or(0.0);
    let last = averages.last().copied().unwrap_or(0.0);
    last + alpha * (observed - last)
}

/// Sample standard deviation of `values` around `average`; 0 for fewer than
/// two values.
pub fn standard_deviation(values: &[f64], average: f64) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| (v - average).powi(2)).sum();
    (sum / (values.len() - 1) as f64).sqrt()
}

/// Departures expected in the next interval: `floor(average + deviation)`.
pub fn predicted_value(observations: &[f64], average: f64) -> usize {
    let predicted = (average + standard_deviation(observations, average)).floor();
    if predicted.is_finite() && predicted > 0.0 {
        predicted as usize
    } else {
        0
    }
}

/// Sliding window of observations and the averages preceding them.
#[derive(Debug)]
struct ObservationWindow {
    observations: VecDeque<f64>,
    /// One longer than `observations`: the last entry is the current average.
    averages: VecDeque<f64>,
}

impl ObservationWindow {
    fn new() -> Self {
        Self {
            observations: VecDeque::new(),
            averages: VecDeque::from([0.0]),
        }
    }

    fn current_average(&self) -> f64 {
        self.averages.back().copied().unwrap_or(0.0)
    }
}

/// Collects departures between ticks.
#[derive(Default)]
struct DepartureCounter {
    removed: Mutex<HashSet<Id>>,
}

impl PeerMapChangeListener for DepartureCounter {
    fn on_inserted(&self, _peer: &PeerAddress, _verified: bool) {}

    fn on_removed(&self, peer: &PeerAddress, _reason: RemovalReason) {
        lock(&self.removed).insert(peer.id());
    }
}

/// The churn predictor.
pub struct AutoReplication {
    peer_map: Arc<PeerMap>,
    config: AutoReplicationConfig,
    departures: Arc<DepartureCounter>,
    window: Mutex<ObservationWindow>,
    current: AtomicUsize,
    registered: Mutex<Option<Arc<dyn PeerMapChangeListener>>>,
}

impl AutoReplication {
    pub fn new(peer_map: Arc<PeerMap>, config: AutoReplicationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            peer_map,
            current: AtomicUsize::new(config.min_factor),
            config,
            departures: Arc::new(DepartureCounter::default()),
            window: Mutex::new(ObservationWindow::new()),
            registered: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AutoReplicationConfig {
        &self.config
    }

    /// Start counting routing table departures.
    pub fn start(&self) {
        let mut registered = lock(&self.registered);
        if registered.is_none() {
            let listener: Arc<dyn PeerMapChangeListener> = self.departures.clone();
            self.peer_map.add_change_listener(Arc::clone(&listener));
            *registered = Some(listener);
        }
    }

    pub fn shutdown(&self) {
        if let Some(listener) = lock(&self.registered).take() {
            self.peer_map.remove_change_listener(&listener);
        }
    }

    /// Departures seen since the last tick.
    pub fn pending_departures(&self) -> usize {
        lock(&self.departures.removed).len()
    }

    /// Fold the departures since the last tick into the window and compute a
    /// new factor. Ticks are serialized.
    pub fn tick(&self) -> usize {
        let departed = {
            let mut removed = lock(&self.departures.removed);
            let count = removed.len();
            removed.clear();
            count
        };
        let peers = self.peer_map.size();

        let mut window = lock(&self.window);
        window.observations.push_back(departed as f64);
        let (observations, averages) = (
            window.observations.make_contiguous().to_vec(),
            window.averages.iter().copied().collect::<Vec<_>>(),
        );
        // The averages preceding each observation.
        let preceding = &averages[averages.len().saturating_sub(observations.len())..];
        let average = ema(&observations, preceding);
        window.averages.push_back(average);
        let predicted = predicted_value(&observations, average);

        let factor = replication_factor(
            predicted,
            peers,
            self.config.reliability,
            self.config.min_factor,
            self.config.max_factor,
        );

        if window.observations.len() >= self.config.observation_length {
            window.observations.pop_front();
            window.averages.pop_front();
        }
        drop(window);

        self.current.store(factor, Ordering::Release);
        trace!(departed, average, predicted, peers, "churn observation");
        debug!(factor, predicted, peers, "replication factor updated");
        factor
    }

    /// The smoothed departure rate after the last tick.
    pub fn average(&self) -> f64 {
        lock(&self.window).current_average()
    }

    /// Number of observations currently in the window.
    pub fn observations(&self) -> usize {
        lock(&self.window).observations.len()
    }
}

impl ReplicationFactor for AutoReplication {
    /// The factor computed by the last tick; `min_factor` before the first.
    fn replication_factor(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AutoReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoReplication")
            .field("config", &self.config)
            .field("factor", &self.replication_factor())
            .finish_non_exhaustive()
    }
}
