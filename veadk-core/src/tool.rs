use crate::CallbackContext;

pub trait ToolContext: CallbackContext {
    /// Provider-issued id of the function call being executed. Empty when the
    /// provider does not assign ids.
    fn function_call_id(&self) -> &str;
}
