use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STOP_POLL: Duration = Duration::from_millis(25);

/// Background thread that runs a closure on a fixed interval until stopped.
///
/// Dropping the sampler stops and joins the thread.
pub struct Sampler {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    tick();
                    let mut waited = Duration::ZERO;
                    while waited < interval && !flag.load(Ordering::Relaxed) {
                        let step = STOP_POLL.min(interval - waited);
                        thread::sleep(step);
                        waited += step;
                    }
                }
            })?;
        tracing::debug!(sampler = name, interval_ms = interval.as_millis() as u64, "sampler started");
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(sampler = %self.name, "sampler thread panicked");
            } else {
                tracing::debug!(sampler = %self.name, "sampler stopped");
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut sampler = Sampler::spawn("test-sampler", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        while count.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sampler.is_running());
        sampler.stop();
        assert!(!sampler.is_running());
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[test]
    fn stop_returns_promptly_for_long_intervals() {
        let mut sampler = Sampler::spawn("slow-sampler", Duration::from_secs(60), || {}).unwrap();
        let started = std::time::Instant::now();
        sampler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
