use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Time source and suspension point for the runner.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock. Simulated delays are multiplied by `time_scale`; `0.0` skips them entirely.
#[derive(Debug, Clone)]
pub struct SystemClock {
    time_scale: f64,
}

impl SystemClock {
    pub fn new(time_scale: f64) -> Self {
        let time_scale = if time_scale.is_finite() && time_scale > 0.0 {
            time_scale
        } else {
            0.0
        };
        Self { time_scale }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if self.time_scale == 0.0 {
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(duration.mul_f64(self.time_scale)).await;
    }
}

/// Uniform samples in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

#[derive(Debug, Clone, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Starts at a fixed instant and jumps forward by whatever it is asked to sleep.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        pub fn fixed() -> Self {
            Self::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            {
                let mut now = self.now.lock().unwrap();
                *now += chrono::Duration::from_std(duration).unwrap();
            }
            tokio::task::yield_now().await;
        }
    }

    pub struct FixedRandom(pub f64);

    impl RandomSource for FixedRandom {
        fn next_f64(&self) -> f64 {
            self.0
        }
    }

    /// Replays the given values in order, then repeats the last one.
    pub struct SequenceRandom {
        values: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
    }

    impl SequenceRandom {
        pub fn new(values: Vec<f64>) -> Self {
            let last = values.last().copied().unwrap_or(0.5);
            Self {
                values: Mutex::new(values.into()),
                last: Mutex::new(last),
            }
        }
    }

    impl RandomSource for SequenceRandom {
        fn next_f64(&self) -> f64 {
            match self.values.lock().unwrap().pop_front() {
                Some(v) => {
                    *self.last.lock().unwrap() = v;
                    v
                }
                None => *self.last.lock().unwrap(),
            }
        }
    }
}
