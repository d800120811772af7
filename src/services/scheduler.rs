//! Scheduler de jobs periódicos
//!
//! Una tarea tokio por job. Las ejecuciones solapadas las descarta el
//! single-flight de cada servicio; al apagar se deja de programar y se
//! espera a las pasadas en curso hasta `grace`.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use super::linking_reconciler::{LinkingReconciler, PassOutcome};
use super::metrics;
use super::telematics_dispatcher::{CycleOutcome, TelematicsDispatcher};

/// Retraso inicial máximo, para no arrancar todos los jobs a la vez
const MAX_START_JITTER: Duration = Duration::from_secs(30);

pub struct JobScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn spawn_reconciler(&mut self, reconciler: Arc<LinkingReconciler>, period: Duration) {
        self.spawn_job(metrics::RECONCILE_JOB, period, move || {
            let reconciler = reconciler.clone();
            async move {
                match reconciler.run_pass().await {
                    Ok(PassOutcome::Completed(_)) | Ok(PassOutcome::Skipped) => {}
                    Err(e) => error!("❌ Reconciliación abortada: {}", e),
                }
            }
        });
    }

    pub fn spawn_dispatcher(&mut self, dispatcher: Arc<TelematicsDispatcher>, period: Duration) {
        self.spawn_job(metrics::DISPATCH_JOB, period, move || {
            let dispatcher = dispatcher.clone();
            async move {
                match dispatcher.poll_linked_vehicles().await {
                    Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Skipped) => {}
                    Err(e) => error!("❌ Carga de datos abortada: {}", e),
                }
            }
        });
    }

    /// Programar `job` cada `period`
    pub fn spawn_job<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let jitter = start_jitter(period);

        let handle = tokio::spawn(async move {
            info!("⏰ Job {} programado cada {:?} (inicio en {:?})", name, period, jitter);

            tokio::select! {
                _ = time::sleep(jitter) => {}
                _ = shutdown.changed() => return,
            }

            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // la pasada no se cancela si llega el apagado mientras corre
                        job().await;
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("🛑 Job {} detenido", name);
        });

        self.handles.push((name, handle));
    }

    /// Dejar de programar y esperar a las pasadas en curso
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.handles {
            match time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("❌ Job {} terminó con error: {}", name, e),
                Err(_) => warn!("⚠️ Job {} no terminó en {:?}, se abandona", name, grace),
            }
        }
    }
}

fn start_jitter(period: Duration) -> Duration {
    let max = (period / 10).min(MAX_START_JITTER);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(0);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_job_runs_periodically_and_stops_on_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = JobScheduler::new();
        let counter = runs.clone();
        scheduler.spawn_job("test", Duration::from_millis(20), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_in_flight_run_finishes_before_shutdown_returns() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut scheduler = JobScheduler::new();
        let counter = finished.clone();
        scheduler.spawn_job("slow", Duration::from_millis(50), move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown(Duration::from_secs(5)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..100 {
            assert!(start_jitter(Duration::from_secs(7200)) <= MAX_START_JITTER);
            assert!(start_jitter(Duration::from_millis(50)) <= Duration::from_millis(5));
        }
    }
}
