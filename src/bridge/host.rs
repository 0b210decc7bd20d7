//! What the page agent can see of the host application.
//!
//! The host is a third-party single-page app with no API for its graph. These
//! traits describe the handful of surfaces the introspection strategies poke
//! at: the canvas root element, the framework's private component instances
//! hanging off it, the host's own menu entries, and the clipboard hooks the
//! host uses for its export feature.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::HostError;

/// Replaceable clipboard entry point: receives the text bound for the system
/// clipboard.
pub type ClipboardWriter = Arc<dyn Fn(&str) -> Result<(), HostError> + Send + Sync>;

/// Click handler of a host control.
pub type ClickHandler = Arc<dyn Fn() -> Result<(), HostError> + Send + Sync>;

/// The host page as seen from the injected script.
pub trait HostPage: Send + Sync {
    /// Root element of the rendered canvas, if one is on the page.
    fn canvas_root(&self) -> Option<Arc<dyn HostElement>>;

    /// Menu entries currently rendered by the host.
    fn menu_controls(&self) -> Vec<Arc<dyn MenuControl>>;

    fn clipboard(&self) -> Arc<dyn ClipboardSurface>;
}

/// A DOM element owned by the host.
pub trait HostElement: Send + Sync {
    /// The rendering framework's private instance handle attached to this
    /// element, if the framework exposes one.
    fn instance_handle(&self) -> Option<Arc<dyn HostObject>>;

    /// Dispatch a synthetic paste event whose clipboard data is `text`.
    ///
    /// Success only means the event was dispatched; the host's handler may
    /// still ignore it.
    fn dispatch_paste(&self, text: &str) -> Result<(), HostError>;
}

/// One object of the host framework's internal instance graph.
pub trait HostObject: Send + Sync {
    /// State returned by a `getState()`-shaped accessor, if this object has one.
    fn store_state(&self) -> Option<Value>;

    /// Objects reachable from this one (children, siblings, owners, props).
    fn links(&self) -> Vec<Arc<dyn HostObject>>;
}

/// A menu entry rendered by the host.
pub trait MenuControl: Send + Sync {
    fn label(&self) -> String;

    fn click_handler(&self) -> Option<ClickHandler>;
}

/// The two paths by which the host writes to the system clipboard: the async
/// `clipboard.writeText` API and the selection copy command.
pub trait ClipboardSurface: Send + Sync {
    fn write_text_hook(&self) -> ClipboardWriter;

    fn set_write_text_hook(&self, hook: ClipboardWriter);

    fn copy_command_hook(&self) -> ClipboardWriter;

    fn set_copy_command_hook(&self, hook: ClipboardWriter);
}
