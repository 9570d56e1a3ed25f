use nalgebra::Vector3;
use std::collections::VecDeque;

/// One (accel, gyro) pair as stored in the calibration window.
pub type SamplePair = (Vector3<f64>, Vector3<f64>);

/// Fixed-capacity FIFO of raw IMU samples.
///
/// Storage is reserved once at construction; pushing into a full window evicts
/// the oldest pair in O(1).
#[derive(Clone, Debug)]
pub struct SampleWindow {
    samples: VecDeque<SamplePair>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SampleWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a pair. Returns the evicted pair when the window was already full.
    pub fn push(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>) -> Option<SamplePair> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back((accel, gyro));
        evicted
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &SamplePair> + '_ {
        self.samples.iter()
    }

    /// The newest `n` pairs (fewer if the window holds less), oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &SamplePair> + '_ {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip)
    }

    pub fn accels(&self) -> impl Iterator<Item = &Vector3<f64>> + '_ {
        self.samples.iter().map(|(a, _)| a)
    }

    /// Owned copy, oldest first, for handing to a background fit.
    pub fn to_vec(&self) -> Vec<SamplePair> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
