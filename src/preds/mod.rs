// Predicate pipeline
// Applies reject and predicate classifiers to changes in parallel and
// ranks the survivors

pub mod defaults;

use std::cmp::Ordering;
use std::sync::Arc;
use std::thread::available_parallelism;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::Result;
use crate::review::change::Change;

/// A shared, scoreable change.
pub type BoardChange = Arc<dyn Change>;

type ApplyFn = Arc<dyn Fn(&dyn Change) -> Result<bool> + Send + Sync>;

/// A named boolean classifier with a ranking score.
#[derive(Clone)]
pub struct Predicate {
    pub name: String,
    pub doc: String,
    pub score: i32,
    apply: ApplyFn,
}

impl Predicate {
    pub fn new(
        name: impl Into<String>,
        doc: impl Into<String>,
        score: i32,
        apply: impl Fn(&dyn Change) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Predicate {
            name: name.into(),
            doc: doc.into(),
            score,
            apply: Arc::new(apply),
        }
    }

    pub fn applies(&self, change: &dyn Change) -> Result<bool> {
        (self.apply)(change)
    }
}

/// A classifier whose truth excludes a change from the dashboard.
#[derive(Clone)]
pub struct Reject {
    pub name: String,
    pub doc: String,
    apply: ApplyFn,
}

impl Reject {
    pub fn new(
        name: impl Into<String>,
        doc: impl Into<String>,
        apply: impl Fn(&dyn Change) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Reject {
            name: name.into(),
            doc: doc.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn applies(&self, change: &dyn Change) -> Result<bool> {
        (self.apply)(change)
    }
}

/// A change plus the predicates that held for it.
#[derive(Clone)]
pub struct ChangePreds {
    pub change: BoardChange,
    /// Names of the predicates that applied, in pipeline order.
    pub preds: Vec<String>,
    /// Sum of the applied predicates' scores.
    pub score: i32,
}

/// Classify changes on a worker pool and return the ranked survivors.
///
/// Each worker applies every reject in order — any hit discards the
/// change — then every predicate, collecting those that hold. Predicate
/// errors are logged and the change kept (best-effort classification).
/// Cancellation stops the feeder and workers promptly; already-collected
/// results are returned, possibly partial. The final sort imposes the
/// observable order, so worker interleaving never shows through.
pub async fn collect_change_preds(
    cancel: &CancellationToken,
    changes: Vec<BoardChange>,
    predicates: &[Predicate],
    rejects: &[Reject],
) -> Vec<ChangePreds> {
    let workers = available_parallelism().map(|n| n.get()).unwrap_or(4);
    let (in_tx, in_rx) = mpsc::channel::<BoardChange>(workers);
    let in_rx = Arc::new(Mutex::new(in_rx));
    let (out_tx, mut out_rx) = mpsc::channel::<ChangePreds>(workers);

    let predicates: Arc<[Predicate]> = predicates.to_vec().into();
    let rejects: Arc<[Reject]> = rejects.to_vec().into();

    let feeder_cancel = cancel.clone();
    let feeder = tokio::spawn(async move {
        for change in changes {
            tokio::select! {
                _ = feeder_cancel.cancelled() => break,
                sent = in_tx.send(change) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping in_tx closes the channel and drains the workers.
    });

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let in_rx = Arc::clone(&in_rx);
        let out_tx = out_tx.clone();
        let predicates = Arc::clone(&predicates);
        let rejects = Arc::clone(&rejects);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let change = {
                    let mut rx = in_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        recv = rx.recv() => recv,
                    }
                };
                let Some(change) = change else { break };
                if let Some(cp) = classify(change, &predicates, &rejects) {
                    if out_tx.send(cp).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }
    drop(out_tx);

    let mut rows = Vec::new();
    while let Some(cp) = out_rx.recv().await {
        rows.push(cp);
    }
    let _ = feeder.await;
    for handle in handles {
        let _ = handle.await;
    }

    sort_change_preds(&mut rows);
    rows
}

/// Apply the classifiers to one change.
fn classify(
    change: BoardChange,
    predicates: &[Predicate],
    rejects: &[Reject],
) -> Option<ChangePreds> {
    for reject in rejects {
        match reject.applies(change.as_ref()) {
            Ok(true) => return None,
            Ok(false) => {}
            Err(err) => {
                warn!(reject = %reject.name, change = %change.id(), %err, "reject failed");
            }
        }
    }
    let mut preds = Vec::new();
    let mut score = 0;
    for pred in predicates {
        match pred.applies(change.as_ref()) {
            Ok(true) => {
                preds.push(pred.name.clone());
                score += pred.score;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(predicate = %pred.name, change = %change.id(), %err, "predicate failed");
            }
        }
    }
    Some(ChangePreds {
        change,
        preds,
        score,
    })
}

/// Rank: descending score, then most recently updated, then ascending id
/// (numerically when both ids are integers, lexically otherwise).
pub fn sort_change_preds(rows: &mut [ChangePreds]) {
    rows.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.change.updated().cmp(&a.change.updated()))
            .then_with(|| id_order(&a.change.id(), &b.change.id()))
    });
}

fn id_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
