//! Ordered, reversible operations against the cluster.
//!
//! An [`Operation`] is a pure description: a named unit of work plus the
//! assertions that must hold after it completes. A [`ReversibleOperation`]
//! pairs it with an inverse whose contract is that undo-after-do leaves the
//! cluster observably unchanged, and that undo is safe even if the forward
//! operation never ran.

use crate::{
    cluster::ClusterHandle,
    errors::{Error, Result},
    kubectl::Manifest,
};
use futures::future::BoxFuture;

type ExecuteFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type AssertFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct Operation {
    name: String,
    execute: ExecuteFn,
    assertions: Vec<AssertFn>,
}

impl Operation {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(move || Box::pin(execute())),
            assertions: Vec::new(),
        }
    }

    /// A no-op operation; useful as the inverse of read-only work.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, || async { Ok(()) })
    }

    /// Adds an assertion that must pass after the operation executes.
    pub fn with_assertion<F, Fut>(mut self, assertion: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.assertions.push(Box::new(move || Box::pin(assertion())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        tracing::debug!(operation = %self.name, "executing");
        (self.execute)().await.map_err(|e| Error::Operation {
            operation: self.name.clone(),
            source: Box::new(e),
        })?;
        for assertion in &self.assertions {
            assertion().await.map_err(|e| Error::Operation {
                operation: self.name.clone(),
                source: Box::new(Error::Assertion(e)),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("assertions", &self.assertions.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct ReversibleOperation {
    pub run: Operation,
    pub undo: Operation,
}

impl ReversibleOperation {
    pub fn new(run: Operation, undo: Operation) -> Self {
        Self { run, undo }
    }

    /// Apply a manifest, undone by deleting it. The delete ignores missing
    /// resources, so the undo is idempotent and safe when the apply never
    /// ran or partially ran.
    pub fn apply_manifest(
        cluster: ClusterHandle,
        manifest: Manifest,
        namespace: Option<String>,
    ) -> Self {
        let name = format!("apply-{manifest}");
        let run = {
            let cluster = cluster.clone();
            let manifest = manifest.clone();
            let namespace = namespace.clone();
            Operation::new(name.clone(), move || {
                let cluster = cluster.clone();
                let manifest = manifest.clone();
                let namespace = namespace.clone();
                async move { cluster.apply(&manifest, namespace.as_deref()).await }
            })
        };
        let undo = Operation::new(format!("delete-{manifest}"), move || {
            let cluster = cluster.clone();
            let manifest = manifest.clone();
            let namespace = namespace.clone();
            async move {
                cluster
                    .delete_ignore_missing(&manifest, namespace.as_deref())
                    .await
            }
        });
        Self { run, undo }
    }
}

/// Per-slot progress through a batch execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Executing,
    Done,
    Failed,
    Undone,
    UndoFailed,
}

/// Executes batches of reversible operations, strictly in order, unwinding
/// completed operations in reverse on the first failure.
#[derive(Debug, Default)]
pub struct Operator {
    slots: Vec<SlotState>,
}

impl Operator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot states from the most recent batch, for inspection after a run.
    pub fn slot_states(&self) -> &[SlotState] {
        &self.slots
    }

    /// Runs the forward phase to completion or first failure; on failure,
    /// undoes every completed operation in reverse order. Undo errors are
    /// aggregated and never short-circuit further unwinding.
    pub async fn execute_reversible(&mut self, ops: &[ReversibleOperation]) -> Result<()> {
        self.slots = vec![SlotState::Pending; ops.len()];

        let mut failure = None;
        for (i, op) in ops.iter().enumerate() {
            self.slots[i] = SlotState::Executing;
            match op.run.run().await {
                Ok(()) => self.slots[i] = SlotState::Done,
                Err(error) => {
                    tracing::warn!(operation = %op.run.name(), %error, "operation failed; unwinding");
                    self.slots[i] = SlotState::Failed;
                    failure = Some(error);
                    break;
                }
            }
        }

        let Some(root) = failure else {
            return Ok(());
        };

        let mut unwind = Vec::new();
        for (i, op) in ops.iter().enumerate().rev() {
            if self.slots[i] != SlotState::Done {
                continue;
            }
            match op.undo.run().await {
                Ok(()) => self.slots[i] = SlotState::Undone,
                Err(error) => {
                    tracing::error!(operation = %op.undo.name(), %error, "undo failed");
                    self.slots[i] = SlotState::UndoFailed;
                    unwind.push(error);
                }
            }
        }

        Err(Error::Unwind {
            root: Box::new(root),
            unwind,
        })
    }

    /// Unconditional teardown: undoes every operation in reverse order,
    /// regardless of whether its forward phase ran. Relies on undo
    /// idempotence; errors are aggregated.
    pub async fn undo_all(&mut self, ops: &[ReversibleOperation]) -> Result<()> {
        let mut errors = Vec::new();
        for op in ops.iter().rev() {
            if let Err(error) = op.undo.run().await {
                tracing::error!(operation = %op.undo.name(), %error, "undo failed");
                errors.push(error);
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        let root = errors.remove(0);
        if errors.is_empty() {
            return Err(root);
        }
        Err(Error::Unwind {
            root: Box::new(root),
            unwind: errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting_op(
        name: &str,
        counter: Arc<AtomicUsize>,
        fail: bool,
    ) -> Operation {
        Operation::new(name, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Validation("forced failure".to_string()))
                } else {
                    Ok(())
                }
            }
        })
    }

    fn reversible(
        name: &str,
        do_count: Arc<AtomicUsize>,
        undo_count: Arc<AtomicUsize>,
        fail: bool,
    ) -> ReversibleOperation {
        ReversibleOperation::new(
            counting_op(name, do_count, fail),
            counting_op(&format!("undo-{name}"), undo_count, false),
        )
    }

    #[tokio::test]
    async fn happy_path_runs_everything_and_nothing_unwinds() {
        let dos: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let undos: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let ops: Vec<_> = (0..3)
            .map(|i| reversible(&format!("op{i}"), dos[i].clone(), undos[i].clone(), false))
            .collect();

        let mut operator = Operator::new();
        operator.execute_reversible(&ops).await.unwrap();

        assert!(dos.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert!(undos.iter().all(|c| c.load(Ordering::SeqCst) == 0));
        assert_eq!(operator.slot_states(), &[SlotState::Done; 3]);
    }

    #[tokio::test]
    async fn middle_failure_contains_and_unwinds() {
        let dos: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let undos: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let ops = vec![
            reversible("op1", dos[0].clone(), undos[0].clone(), false),
            reversible("op2", dos[1].clone(), undos[1].clone(), true),
            reversible("op3", dos[2].clone(), undos[2].clone(), false),
        ];

        let mut operator = Operator::new();
        let err = operator.execute_reversible(&ops).await.unwrap_err();

        // op3 never ran; op1's undo ran exactly once; op2's undo never ran.
        assert_eq!(dos[2].load(Ordering::SeqCst), 0);
        assert_eq!(undos[0].load(Ordering::SeqCst), 1);
        assert_eq!(undos[1].load(Ordering::SeqCst), 0);

        match &err {
            Error::Unwind { root, unwind } => {
                assert!(unwind.is_empty());
                assert!(root.to_string().contains("op2"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            operator.slot_states(),
            &[SlotState::Undone, SlotState::Failed, SlotState::Pending]
        );
    }

    #[tokio::test]
    async fn failing_assertion_fails_the_operation() {
        let undo_count = Arc::new(AtomicUsize::new(0));
        let ops = vec![
            ReversibleOperation::new(
                Operation::noop("op1"),
                counting_op("undo-op1", undo_count.clone(), false),
            ),
            ReversibleOperation::new(
                Operation::noop("op2")
                    .with_assertion(|| async { anyhow::bail!("condition never held") }),
                Operation::noop("undo-op2"),
            ),
        ];

        let mut operator = Operator::new();
        let err = operator.execute_reversible(&ops).await.unwrap_err();
        assert_eq!(undo_count.load(Ordering::SeqCst), 1);
        assert!(err.root_cause().to_string().contains("condition never held"));
        assert_eq!(
            operator.slot_states(),
            &[SlotState::Undone, SlotState::Failed]
        );
    }

    #[tokio::test]
    async fn undo_errors_aggregate_without_short_circuiting() {
        let undone = Arc::new(AtomicUsize::new(0));
        let failing_undo = || {
            Operation::new("undo-fails", || async {
                Err(Error::Delete {
                    code: 1,
                    stderr: "gone wrong".to_string(),
                })
            })
        };
        let ops = vec![
            ReversibleOperation::new(
                Operation::noop("op1"),
                counting_op("undo-op1", undone.clone(), false),
            ),
            ReversibleOperation::new(Operation::noop("op2"), failing_undo()),
            ReversibleOperation::new(
                Operation::new("op3", || async {
                    Err(Error::Validation("forced".to_string()))
                }),
                Operation::noop("undo-op3"),
            ),
        ];

        let mut operator = Operator::new();
        let err = operator.execute_reversible(&ops).await.unwrap_err();
        match &err {
            Error::Unwind { root, unwind } => {
                assert!(root.to_string().contains("op3"));
                assert_eq!(unwind.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // op1's undo still ran even though op2's undo failed first.
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert_eq!(
            operator.slot_states(),
            &[SlotState::Undone, SlotState::UndoFailed, SlotState::Failed]
        );
    }

    #[tokio::test]
    async fn undo_all_is_idempotent_teardown() {
        let undo_count = Arc::new(AtomicUsize::new(0));
        let ops = vec![ReversibleOperation::new(
            Operation::noop("op1"),
            counting_op("undo-op1", undo_count.clone(), false),
        )];

        let mut operator = Operator::new();
        operator.undo_all(&ops).await.unwrap();
        operator.undo_all(&ops).await.unwrap();
        assert_eq!(undo_count.load(Ordering::SeqCst), 2);
    }
}
