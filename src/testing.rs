//! Test doubles: a scripted SSE server and an in-memory host page.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{
    bridge::host::{
        ClickHandler, ClipboardSurface, ClipboardWriter, HostElement, HostObject, HostPage,
        MenuControl,
    },
    credentials::TokenStore,
    errors::HostError,
    Client, Config,
};

/// Token used by [`test_client`].
pub const TEST_TOKEN: &str = "Bearer test-token";

/// Create a test client pointed at a local server, already signed in.
pub fn test_client(base_url: &str) -> Client {
    Client::new(
        Config {
            base_url: Some(base_url.to_string()),
            ..Default::default()
        },
        TokenStore::with_token(TEST_TOKEN),
    )
    .expect("client")
}

/// Start a local SSE server that answers one request, writing each payload as
/// a `data:` frame after its delay.
pub async fn start_chunked_sse_server(
    steps: Vec<(Duration, String)>,
    finish_after: Option<Duration>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        // Read request headers.
        let mut buf = [0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            if n == 0 {
                return;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let headers = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/event-stream\r\n",
            "Cache-Control: no-cache\r\n",
            "Transfer-Encoding: chunked\r\n",
            "\r\n"
        );
        if socket.write_all(headers.as_bytes()).await.is_err() {
            return;
        }

        for (delay, payload) in steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let frame = format!("data: {payload}\n\n");
            let chunk = format!("{:X}\r\n{}\r\n", frame.len(), frame);
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }

        if let Some(delay) = finish_after {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let _ = socket.write_all(b"0\r\n\r\n").await;
    });

    format!("http://{}", addr)
}

/// Node of a fake framework instance graph.
#[derive(Default)]
pub struct FakeObject {
    state: Mutex<Option<Value>>,
    links: Mutex<Vec<Arc<dyn HostObject>>>,
}

impl FakeObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Object exposing `state` through its `getState()` accessor.
    pub fn with_state(state: Value) -> Arc<Self> {
        let obj = Self::new();
        obj.set_state(Some(state));
        obj
    }

    pub fn set_state(&self, state: Option<Value>) {
        *self.state.lock().expect("state poisoned") = state;
    }

    pub fn link(&self, other: Arc<FakeObject>) {
        self.links.lock().expect("links poisoned").push(other);
    }

    /// Root of a path of `depth` empty objects ending in `target`.
    pub fn chain(depth: usize, target: Arc<FakeObject>) -> Arc<FakeObject> {
        let mut current = target;
        for _ in 0..depth {
            let parent = FakeObject::new();
            parent.link(current);
            current = parent;
        }
        current
    }
}

impl HostObject for FakeObject {
    fn store_state(&self) -> Option<Value> {
        self.state.lock().expect("state poisoned").clone()
    }

    fn links(&self) -> Vec<Arc<dyn HostObject>> {
        self.links.lock().expect("links poisoned").clone()
    }
}

struct FakeCanvas {
    instance: Option<Arc<FakeObject>>,
    pastes: Mutex<Vec<String>>,
    paste_error: Mutex<Option<String>>,
}

impl HostElement for FakeCanvas {
    fn instance_handle(&self) -> Option<Arc<dyn HostObject>> {
        self.instance
            .clone()
            .map(|obj| obj as Arc<dyn HostObject>)
    }

    fn dispatch_paste(&self, text: &str) -> Result<(), HostError> {
        if let Some(message) = self.paste_error.lock().expect("paste poisoned").clone() {
            return Err(HostError::new(message));
        }
        self.pastes
            .lock()
            .expect("paste poisoned")
            .push(text.to_string());
        Ok(())
    }
}

struct FakeMenu {
    label: String,
    handler: Option<ClickHandler>,
}

impl MenuControl for FakeMenu {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn click_handler(&self) -> Option<ClickHandler> {
        self.handler.clone()
    }
}

/// Clipboard whose original hooks record what reached the "system"
/// clipboard.
pub struct FakeClipboard {
    write_text: Mutex<ClipboardWriter>,
    copy_command: Mutex<ClipboardWriter>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeClipboard {
    fn new() -> Arc<Self> {
        let writes: Arc<Mutex<Vec<String>>> = Arc::default();
        let recorder = |writes: Arc<Mutex<Vec<String>>>| -> ClipboardWriter {
            Arc::new(move |text: &str| {
                writes
                    .lock()
                    .expect("clipboard poisoned")
                    .push(text.to_string());
                Ok(())
            })
        };
        Arc::new(Self {
            write_text: Mutex::new(recorder(writes.clone())),
            copy_command: Mutex::new(recorder(writes.clone())),
            writes,
        })
    }
}

impl ClipboardSurface for FakeClipboard {
    fn write_text_hook(&self) -> ClipboardWriter {
        self.write_text.lock().expect("clipboard poisoned").clone()
    }

    fn set_write_text_hook(&self, hook: ClipboardWriter) {
        *self.write_text.lock().expect("clipboard poisoned") = hook;
    }

    fn copy_command_hook(&self) -> ClipboardWriter {
        self.copy_command.lock().expect("clipboard poisoned").clone()
    }

    fn set_copy_command_hook(&self, hook: ClipboardWriter) {
        *self.copy_command.lock().expect("clipboard poisoned") = hook;
    }
}

/// In-memory host page.
pub struct FakeHost {
    canvas: Option<Arc<FakeCanvas>>,
    menus: Mutex<Vec<Arc<FakeMenu>>>,
    clipboard: Arc<FakeClipboard>,
}

impl FakeHost {
    /// A page without a canvas.
    pub fn empty() -> Self {
        Self {
            canvas: None,
            menus: Mutex::new(Vec::new()),
            clipboard: FakeClipboard::new(),
        }
    }

    /// A page whose canvas root carries `instance` as its framework handle.
    pub fn with_canvas(instance: Arc<FakeObject>) -> Self {
        Self {
            canvas: Some(Arc::new(FakeCanvas {
                instance: Some(instance),
                pastes: Mutex::new(Vec::new()),
                paste_error: Mutex::new(None),
            })),
            ..Self::empty()
        }
    }

    /// Texts received by synthetic paste events, in order.
    pub fn pasted(&self) -> Vec<String> {
        self.canvas
            .as_ref()
            .map(|c| c.pastes.lock().expect("paste poisoned").clone())
            .unwrap_or_default()
    }

    /// Make the canvas paste handler throw `message`.
    pub fn fail_pastes(&self, message: impl Into<String>) {
        if let Some(canvas) = &self.canvas {
            *canvas.paste_error.lock().expect("paste poisoned") = Some(message.into());
        }
    }

    /// Menu entry that copies `text` through `clipboard.writeText`, as the
    /// host's export feature does.
    pub fn add_export_menu(&self, label: impl Into<String>, text: impl Into<String>) {
        self.add_copying_menu(label, vec![text.into()]);
    }

    /// Menu entry whose click writes each of `texts` to the clipboard in turn.
    pub fn add_copying_menu(&self, label: impl Into<String>, texts: Vec<String>) {
        let clipboard = self.clipboard.clone();
        let handler: ClickHandler = Arc::new(move || {
            texts
                .iter()
                .try_for_each(|text| (clipboard.write_text_hook())(text.as_str()))
        });
        self.add_menu(label, Some(handler));
    }

    /// Menu entry whose click does nothing.
    pub fn add_silent_menu(&self, label: impl Into<String>) {
        self.add_menu(label, Some(Arc::new(|| Ok::<(), HostError>(()))));
    }

    /// Menu entry whose click handler throws.
    pub fn add_failing_menu(&self, label: impl Into<String>) {
        let handler: ClickHandler = Arc::new(|| Err(HostError::new("click handler threw")));
        self.add_menu(label, Some(handler));
    }

    fn add_menu(&self, label: impl Into<String>, handler: Option<ClickHandler>) {
        self.menus.lock().expect("menus poisoned").push(Arc::new(FakeMenu {
            label: label.into(),
            handler,
        }));
    }

    /// Texts that reached the system clipboard.
    pub fn clipboard_writes(&self) -> Vec<String> {
        self.clipboard.writes.lock().expect("clipboard poisoned").clone()
    }
}

impl HostPage for FakeHost {
    fn canvas_root(&self) -> Option<Arc<dyn HostElement>> {
        self.canvas
            .clone()
            .map(|canvas| canvas as Arc<dyn HostElement>)
    }

    fn menu_controls(&self) -> Vec<Arc<dyn MenuControl>> {
        self.menus
            .lock()
            .expect("menus poisoned")
            .iter()
            .map(|menu| menu.clone() as Arc<dyn MenuControl>)
            .collect()
    }

    fn clipboard(&self) -> Arc<dyn ClipboardSurface> {
        self.clipboard.clone()
    }
}
