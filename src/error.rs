use std::time::Duration;

use thiserror::Error;

/// Error kinds the workflow engine can discriminate on.
///
/// Most plumbing failures travel as plain [`anyhow::Error`] chains; the
/// variants here are the ones callers match against, so they are raised
/// into `anyhow` and recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no free ip block left in the pool")]
    NoFreeIpBlock,

    #[error("vm {instance_id} did not answer ssh within {waited:?}")]
    VmBootTimeout {
        instance_id: String,
        waited: Duration,
    },

    #[error("remote command exited with code {code:?}: {stderr}")]
    SshExecFailed { code: Option<i32>, stderr: String },

    #[error("ssh session was disposed while the command was in flight")]
    SshDisposed,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("{}", composite_summary(.causes))]
    Composite { causes: Vec<anyhow::Error> },
}

fn composite_summary(causes: &[anyhow::Error]) -> String {
    let rendered = causes
        .iter()
        .map(|cause| format!("{cause:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} errors occurred together: {rendered}", causes.len())
}

fn into_causes(err: anyhow::Error) -> Vec<anyhow::Error> {
    //flatten nested composites so joining stays associative
    match err.downcast::<AgentError>() {
        Ok(AgentError::Composite { causes }) => causes,
        Ok(other) => vec![anyhow::Error::new(other)],
        Err(err) => vec![err],
    }
}

/// Joins two errors that must be surfaced together, e.g. a task failure
/// plus the failure to persist its status.
pub fn join_errors(first: anyhow::Error, second: anyhow::Error) -> anyhow::Error {
    let mut causes = into_causes(first);
    causes.extend(into_causes(second));
    AgentError::Composite { causes }.into()
}

/// Collapses a list of teardown step failures into zero, one, or a
/// composite error.
pub fn combine_errors(mut errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errs.len() {
        0 => None,
        1 => Some(errs.remove(0)),
        _ => {
            let causes = errs.into_iter().flat_map(into_causes).collect();
            Some(AgentError::Composite { causes }.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn join_produces_composite_with_both_causes() {
        let joined = join_errors(anyhow!("first thing broke"), anyhow!("second thing broke"));
        let composite = joined
            .downcast_ref::<AgentError>()
            .expect("joined error should be an AgentError");
        match composite {
            AgentError::Composite { causes } => {
                assert_eq!(causes.len(), 2);
            }
            other => panic!("expected composite, got {other}"),
        }
    }

    #[test]
    fn join_flattens_nested_composites() {
        let inner = join_errors(anyhow!("a"), anyhow!("b"));
        let joined = join_errors(inner, anyhow!("c"));
        match joined.downcast_ref::<AgentError>().unwrap() {
            AgentError::Composite { causes } => assert_eq!(causes.len(), 3),
            other => panic!("expected composite, got {other}"),
        }
    }

    #[test]
    fn combine_passes_single_error_through() {
        let combined = combine_errors(vec![AgentError::NoFreeIpBlock.into()])
            .expect("one error in means one error out");
        assert!(matches!(
            combined.downcast_ref::<AgentError>(),
            Some(AgentError::NoFreeIpBlock)
        ));
    }

    #[test]
    fn combine_of_nothing_is_nothing() {
        assert!(combine_errors(Vec::new()).is_none());
    }

    #[test]
    fn composite_display_mentions_every_cause() {
        let joined = join_errors(anyhow!("disk is gone"), anyhow!("tap is gone"));
        let rendered = format!("{joined}");
        assert!(rendered.contains("disk is gone"));
        assert!(rendered.contains("tap is gone"));
    }
}
