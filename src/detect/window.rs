/// Fixed-capacity ring buffer of fused scores.
///
/// Once full, each push overwrites the oldest score. Statistics are computed
/// by a full scan, which keeps them exact for the window sizes we use.
#[derive(Debug, Clone)]
pub struct ScoreWindow {
    buf: Vec<f64>,
    capacity: usize,
    /// Index of the slot the next push writes to once the buffer is full.
    cursor: usize,
}

impl ScoreWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// Append a score, returning the one it displaced if the window was full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.buf.len() < self.capacity {
            self.buf.push(value);
            return None;
        }
        let old = std::mem::replace(&mut self.buf[self.cursor], value);
        self.cursor = (self.cursor + 1) % self.capacity;
        Some(old)
    }

    /// Revert the most recent `push`, given the value it returned.
    pub fn undo_push(&mut self, displaced: Option<f64>) {
        match displaced {
            None => {
                self.buf.pop();
            }
            Some(old) => {
                self.cursor = (self.cursor + self.capacity - 1) % self.capacity;
                self.buf[self.cursor] = old;
            }
        }
    }

    /// Scores in arrival order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let (newer, older) = self.buf.split_at(self.cursor);
        older.iter().chain(newer.iter()).copied()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.buf.iter().sum::<f64>() / self.buf.len() as f64
    }

    /// Population variance (divides by n).
    pub fn variance(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.buf.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.buf.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Absolute z-scores of every score in the window. Empty when the
    /// standard deviation is zero.
    pub fn abs_z_scores(&self) -> Vec<f64> {
        let std = self.std_dev();
        if std == 0.0 {
            return Vec::new();
        }
        let mean = self.mean();
        self.buf.iter().map(|&x| ((x - mean) / std).abs()).collect()
    }
}

/// Percentile with linear interpolation between closest ranks.
/// `p` is in [0, 100]. Returns `None` for an empty input.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
