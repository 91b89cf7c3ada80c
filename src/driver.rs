//! Driver (C6, §4.5): schedules Resource Processors in onetime / interval /
//! watch mode, with FIFO call queueing and cooperative cancellation.
//!
//! Grounded on `original_source/processor.go` + `processor_run.go` (mode
//! selection, `monitorPrefix` per-descriptor task loop, dequeue-one-Call
//! worker) combined with the teacher's `SourceRegistry::watch` (one task
//! per source, shared cancellation via a broadcast signal).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinSet;

use crate::backend::{Cancel, Client};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::kvstore::KVStore;
use crate::options::{Mode, Options};
use crate::processor::ResourceProcessor;
use crate::resource::make_all;

/// A reified in-flight invocation: immutable config, client handle, chosen
/// options, a terminal result slot and a completion signal. The result
/// channel is a one-shot, so publishing it never blocks the worker.
struct Call {
    config: Arc<EngineConfig>,
    client: Arc<dyn Client>,
    options: Options,
    cancel_tx: watch::Sender<bool>,
    result_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

/// Handle returned by [`Driver::go`]; await [`CallHandle::wait`] for the
/// Call's terminal result, or call [`CallHandle::cancel`] to stop it early.
pub struct CallHandle {
    result_rx: oneshot::Receiver<Result<()>>,
    cancel_tx: watch::Sender<bool>,
}

impl CallHandle {
    pub async fn wait(self) -> Result<()> {
        self.result_rx.await.unwrap_or(Err(Error::Shutdown))
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

pub struct Driver {
    queue: Arc<Mutex<VecDeque<Call>>>,
    queue_notify: Arc<Notify>,
    closing_tx: watch::Sender<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Driver {
    pub fn new() -> Arc<Self> {
        let (closing_tx, closing_rx) = watch::channel(false);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let queue_notify = Arc::new(Notify::new());
        let tasks = Arc::new(Mutex::new(JoinSet::new()));

        let driver = Arc::new(Self {
            queue: queue.clone(),
            queue_notify: queue_notify.clone(),
            closing_tx,
            worker: Mutex::new(None),
            tasks: tasks.clone(),
        });

        let worker_driver = driver.clone();
        let handle = tokio::spawn(async move {
            worker_driver.worker_loop(queue, queue_notify, closing_rx, tasks).await;
        });

        // Stash synchronously: `new` is not async, so use try_lock — the
        // mutex is uncontended at construction time.
        if let Ok(mut guard) = driver.worker.try_lock() {
            *guard = Some(handle);
        }

        driver
    }

    /// Validates config and enqueues a Call; rejects with *Shutdown* if the
    /// driver is already closing (§4.5.5).
    pub async fn go(
        &self,
        config: Arc<EngineConfig>,
        client: Arc<dyn Client>,
        options: Options,
    ) -> Result<CallHandle> {
        config.validate()?;

        if *self.closing_tx.borrow() {
            return Err(Error::Shutdown);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let call = Call {
            config,
            client,
            options,
            cancel_tx: cancel_tx.clone(),
            result_tx: Mutex::new(Some(result_tx)),
        };

        self.queue.lock().await.push_back(call);
        self.queue_notify.notify_one();

        Ok(CallHandle { result_rx, cancel_tx })
    }

    /// Convenience wrapper: enqueues a Call and blocks until it finishes.
    pub async fn run(&self, config: Arc<EngineConfig>, client: Arc<dyn Client>, options: Options) -> Result<()> {
        self.go(config, client, options).await?.wait().await
    }

    /// Idempotent: closes the global cancel signal, drains the pending
    /// queue (publishing *Shutdown* to each), and waits for all spawned
    /// Call tasks to finish.
    pub async fn close(&self) {
        if *self.closing_tx.borrow() {
            return;
        }
        let _ = self.closing_tx.send(true);
        self.queue_notify.notify_one();

        let mut queue = self.queue.lock().await;
        while let Some(call) = queue.pop_front() {
            if let Some(tx) = call.result_tx.lock().await.take() {
                let _ = tx.send(Err(Error::Shutdown));
            }
        }
        drop(queue);

        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: Arc<Mutex<VecDeque<Call>>>,
        queue_notify: Arc<Notify>,
        mut closing_rx: watch::Receiver<bool>,
        tasks: Arc<Mutex<JoinSet<()>>>,
    ) {
        loop {
            let next = queue.lock().await.pop_front();
            match next {
                Some(call) => {
                    let closing_rx = closing_rx.clone();
                    tasks.lock().await.spawn(async move {
                        run_call(call, closing_rx).await;
                    });
                }
                None => {
                    if *closing_rx.borrow() {
                        return;
                    }
                    tokio::select! {
                        _ = queue_notify.notified() => {},
                        _ = closing_rx.changed() => {
                            if *closing_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn run_call(call: Call, closing_rx: watch::Receiver<bool>) {
    let cancel_rx = merge_cancel(closing_rx, call.cancel_tx.subscribe());
    let result = dispatch(&call.config, call.client.clone(), &call.options, cancel_rx).await;

    if let Some(tx) = call.result_tx.lock().await.take() {
        let _ = tx.send(result);
    }
}

/// Folds the driver-global and per-call cancel signals into one receiver a
/// task can observe with a single `changed()`/`borrow()` pair.
fn merge_cancel(mut global: watch::Receiver<bool>, mut local: watch::Receiver<bool>) -> Cancel {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            if *global.borrow() || *local.borrow() {
                let _ = tx.send(true);
                return;
            }
            tokio::select! {
                r = global.changed() => if r.is_err() { return },
                r = local.changed() => if r.is_err() { return },
            }
        }
    });
    rx
}

async fn dispatch(config: &EngineConfig, client: Arc<dyn Client>, options: &Options, cancel: Cancel) -> Result<()> {
    match options.mode() {
        Mode::Onetime => run_onetime(config, client.as_ref(), options).await,
        Mode::Interval => run_interval(config, client.as_ref(), options, cancel).await,
        Mode::Watch => run_watch(config, client, options, cancel).await,
        Mode::Unset if client.watch_enabled() => run_watch(config, client, options, cancel).await,
        Mode::Unset => run_interval(config, client.as_ref(), options, cancel).await,
    }
}

/// Enumerates descriptors via [`make_all`] and builds one processor per
/// descriptor. The enumeration's `last_error`, if any, rides along beside
/// the processors rather than aborting the build (§7).
fn build_processors(
    config: &EngineConfig,
    name_prefix: &str,
) -> Result<(Vec<ResourceProcessor>, Option<Error>)> {
    let (descriptors, last_error) = make_all(&config.conf_dir, &config.ignored)?;
    let processors = descriptors
        .into_iter()
        .map(|(path, descriptor)| {
            let name = path
                .file_stem()
                .map(|s| format!("{name_prefix}{}", s.to_string_lossy()))
                .unwrap_or_else(|| name_prefix.to_owned());
            ResourceProcessor::new(name, descriptor, config, Arc::new(KVStore::new()))
        })
        .collect();
    Ok((processors, last_error))
}

/// §4.5.2: process every descriptor once, in stable path-ascending order.
/// Individual failures are logged, not fatal; the Call's error is the
/// first one encountered, if any.
async fn run_onetime(config: &EngineConfig, client: &dyn Client, options: &Options) -> Result<()> {
    let (mut processors, mut first_error) = build_processors(config, "")?;
    let pgp = pgp_key(config)?;

    for processor in &mut processors {
        let env = processor.environment(options, pgp.clone());
        if let Err(e) = processor.process(client, &env, options).await {
            log::error!("{}: {e}", processor.name());
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// §4.5.3: loop enumerate+process-all, then sleep for the resolved
/// interval; exits promptly when `cancel` fires.
async fn run_interval(
    config: &EngineConfig,
    client: &dyn Client,
    options: &Options,
    mut cancel: Cancel,
) -> Result<()> {
    let pgp = pgp_key(config)?;

    loop {
        if *cancel.borrow() {
            return Ok(());
        }

        match build_processors(config, "") {
            Ok((mut processors, enum_error)) => {
                if let Some(e) = enum_error {
                    log::warn!("enumeration completed with at least one bad descriptor: {e}");
                }
                for processor in &mut processors {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                    let env = processor.environment(options, pgp.clone());
                    if let Err(e) = processor.process(client, &env, options).await {
                        log::error!("{}: {e}", processor.name());
                    }
                }
            }
            Err(e) => log::warn!("could not enumerate descriptors: {e}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(options.resolved_interval()) => {},
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// §4.5.4: enumerate once, spawn one task per descriptor; each loops on
/// `watch_prefix` and re-processes on every wake-up.
async fn run_watch(
    config: &EngineConfig,
    client: Arc<dyn Client>,
    options: &Options,
    cancel: Cancel,
) -> Result<()> {
    let (processors, enum_error) = build_processors(config, "")?;
    if let Some(e) = enum_error {
        log::warn!("enumeration completed with at least one bad descriptor: {e}");
    }
    let mut tasks = JoinSet::new();

    for mut processor in processors {
        let cancel = cancel.clone();
        let client = client.clone();
        let pgp = pgp_key(config)?;
        let options = options.clone();
        tasks.spawn(async move {
            let mut last_index = 0u64;
            loop {
                if *cancel.borrow() {
                    return;
                }

                let prefix = processor.name().to_owned();
                match client.watch_prefix(&prefix, &processor.keys(), last_index, cancel.clone()).await {
                    Ok(index) => last_index = index,
                    Err(e) => {
                        log::error!("{}: watch_prefix failed: {e}", processor.name());
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                }

                if *cancel.borrow() {
                    return;
                }

                let env = processor.environment(&options, pgp.clone());
                if let Err(e) = processor.process(client.as_ref(), &env, &options).await {
                    log::error!("{}: {e}", processor.name());
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn pgp_key(config: &EngineConfig) -> Result<Option<Arc<crate::pgp::PgpKey>>> {
    match config.pgp_private_key()? {
        Some(bytes) => Ok(Some(Arc::new(
            crate::pgp::PgpKey::from_bytes(&bytes).map_err(|e| Error::PgpDecrypt(e.to_string()))?,
        ))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Mode;

    #[test]
    fn mode_precedence_matches_options() {
        assert_eq!(Options::new().mode(), Mode::Unset);
        assert_eq!(Options::new().onetime_mode().mode(), Mode::Onetime);
    }
}
