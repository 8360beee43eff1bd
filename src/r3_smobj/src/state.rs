use crate::{
    error::BadContextError,
    port::{LocalTask, PortKernel},
};

/// If the current context is not a task context, return `Err(BadContext)`.
/// Otherwise, return the current task.
pub(super) fn expect_task_context<P: PortKernel + ?Sized>(
    port: &P,
) -> Result<LocalTask, BadContextError> {
    if port.is_interrupt_context() {
        return Err(BadContextError::BadContext);
    }
    port.current_task().ok_or(BadContextError::BadContext)
}

/// If the current context is an interrupt context, return `Err(BadContext)`.
pub(super) fn expect_non_interrupt_context<P: PortKernel + ?Sized>(
    port: &P,
) -> Result<(), BadContextError> {
    if port.is_interrupt_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}
