// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task-scoped workspace binding.
//!
//! Every job handler runs inside a workspace scope pushed before dispatch
//! and popped on exit, so adapter calls observe the correct tenant even
//! when workers interleave jobs from different workspaces.

use std::future::Future;

tokio::task_local! {
    static WORKSPACE: String;
}

/// Run `fut` with the workspace bound for the duration of the task.
pub async fn with_workspace<F>(workspace: &str, fut: F) -> F::Output
where
    F: Future,
{
    WORKSPACE.scope(workspace.to_string(), fut).await
}

/// The workspace bound to the current task, if any.
#[must_use]
pub fn current_workspace() -> Option<String> {
    WORKSPACE.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_is_scoped_and_reset() {
        assert!(current_workspace().is_none());
        with_workspace("w1", async {
            assert_eq!(current_workspace().as_deref(), Some("w1"));
            with_workspace("w2", async {
                assert_eq!(current_workspace().as_deref(), Some("w2"));
            })
            .await;
            assert_eq!(current_workspace().as_deref(), Some("w1"));
        })
        .await;
        assert!(current_workspace().is_none());
    }

    #[tokio::test]
    async fn concurrent_tasks_see_their_own_workspace() {
        let a = tokio::spawn(with_workspace("wa", async {
            tokio::task::yield_now().await;
            current_workspace()
        }));
        let b = tokio::spawn(with_workspace("wb", async {
            tokio::task::yield_now().await;
            current_workspace()
        }));
        assert_eq!(a.await.unwrap().as_deref(), Some("wa"));
        assert_eq!(b.await.unwrap().as_deref(), Some("wb"));
    }
}
