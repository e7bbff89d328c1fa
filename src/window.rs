use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("sliding window capacity must be at least 1")]
    ZeroCapacity,
}

/// Fixed-capacity ring buffer. Pushing into a full window evicts the oldest
/// sample; iteration yields samples oldest first.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    buffer: Vec<T>,
    capacity: usize,
    // index of the oldest sample once the buffer has wrapped
    start: usize,
}

impl<T: Copy> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }
        Ok(Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            start: 0,
        })
    }

    pub fn push(&mut self, value: T) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(value);
            return;
        }
        self.buffer[self.start] = value;
        self.start = (self.start + 1) % self.capacity;
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    /// Most recently pushed sample.
    pub fn back(&self) -> Option<T> {
        if self.buffer.is_empty() {
            return None;
        }
        let idx = (self.start + self.buffer.len() - 1) % self.buffer.len();
        Some(self.buffer[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let (newer, older) = self.buffer.split_at(self.start);
        older.iter().chain(newer.iter()).copied()
    }
}

impl SlidingWindow<f64> {
    pub fn mean(&self) -> f64 {
        if self.buffer.is_empty() {
            return 0.0;
        }
        self.iter().sum::<f64>() / self.count() as f64
    }

    /// Bessel-corrected standard deviation around `mean`. NaN for fewer than
    /// two samples, where it is undefined.
    pub fn sample_std_dev(&self, mean: f64) -> f64 {
        if self.count() < 2 {
            return f64::NAN;
        }
        let sum_sq: f64 = self.iter().map(|v| (v - mean).powi(2)).sum();
        (sum_sq / (self.count() - 1) as f64).sqrt()
    }
}
