//! Lifecycle coordination for a group of cooperating tasks.
//!
//! A `Syncer` ties tasks together so they all stop together: the first
//! task to report itself dead (or an explicit `kill()`) makes the kill
//! signal ready for everyone, and `wait()` returns once every registered
//! task has reported dead.

use log::debug;
use tokio::sync::{mpsc, watch};

enum Event {
    Add(&'static str),
    Dead(&'static str),
    Kill,
}

#[derive(Clone)]
pub struct Syncer {
    tx: mpsc::UnboundedSender<Event>,
    kill_rx: watch::Receiver<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Syncer {
    pub fn new() -> Syncer {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut cnt: u32 = 0;
            let mut killing = false;
            while let Some(ev) = rx.recv().await {
                match ev {
                    Event::Add(name) => {
                        debug!("task registered: {}", name);
                        cnt += 1;
                    }
                    Event::Dead(name) => {
                        debug!("task exited: {}", name);
                        cnt = cnt.saturating_sub(1);
                        killing = true;
                        let _ = kill_tx.send(true);
                    }
                    Event::Kill => {
                        killing = true;
                        let _ = kill_tx.send(true);
                    }
                }
                if killing && cnt == 0 {
                    let _ = done_tx.send(true);
                    return;
                }
            }
        });

        Syncer { tx, kill_rx, done_rx }
    }

    /// Registers a task. Call before spawning it, so its later
    /// `report_dead` cannot be counted first.
    pub fn add(&self, name: &'static str) {
        let _ = self.tx.send(Event::Add(name));
    }

    /// A task announces it has exited. The first announcement makes the
    /// kill signal ready.
    pub fn report_dead(&self, name: &'static str) {
        let _ = self.tx.send(Event::Dead(name));
    }

    /// Requests that every task stop, without counting as a death.
    pub fn kill(&self) {
        let _ = self.tx.send(Event::Kill);
    }

    /// Resolves once the kill signal is ready.
    pub async fn killed(&self) {
        let mut rx = self.kill_rx.clone();
        // a closed channel means the bookkeeper already wound down
        let _ = rx.wait_for(|k| *k).await;
    }

    /// Resolves once every registered task has reported dead after a kill
    /// began.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|d| *d).await;
    }
}

impl Default for Syncer {
    fn default() -> Self {
        Syncer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn first_death_fires_kill_for_all() {
        let snc = Syncer::new();
        snc.add("a");
        snc.add("b");

        let watcher = {
            let snc = snc.clone();
            tokio::spawn(async move {
                snc.killed().await;
                snc.report_dead("b");
            })
        };

        snc.report_dead("a");
        watcher.await.unwrap();
        timeout(Duration::from_secs(1), snc.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_count_is_zero() {
        let snc = Syncer::new();
        snc.add("a");
        snc.add("b");
        snc.report_dead("a");

        // one task still alive, wait must not resolve yet
        assert!(timeout(Duration::from_millis(50), snc.wait()).await.is_err());

        snc.report_dead("b");
        timeout(Duration::from_secs(1), snc.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn add_accepted_after_first_death() {
        let snc = Syncer::new();
        snc.add("a");
        snc.add("b");
        snc.report_dead("a");

        // registration after the first death still holds wait() open
        snc.add("late");
        snc.report_dead("b");
        assert!(timeout(Duration::from_millis(50), snc.wait()).await.is_err());
        snc.report_dead("late");
        timeout(Duration::from_secs(1), snc.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_kill_with_no_tasks_completes() {
        let snc = Syncer::new();
        snc.kill();
        timeout(Duration::from_secs(1), snc.killed()).await.unwrap();
        timeout(Duration::from_secs(1), snc.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_kill_waits_for_live_tasks() {
        let snc = Syncer::new();
        snc.add("worker");

        let worker = {
            let snc = snc.clone();
            tokio::spawn(async move {
                snc.killed().await;
                snc.report_dead("worker");
            })
        };

        snc.kill();
        worker.await.unwrap();
        timeout(Duration::from_secs(1), snc.wait()).await.unwrap();
    }
}
