//! Chromium driven through a long-lived Playwright helper.
//!
//! One `node` process per engine runs [`HELPER_SCRIPT`], which owns the
//! browser and answers JSON-line commands on stdin/stdout. Responses carry the
//! request id; unsolicited `event` lines report readiness and disconnects.
//!
//! A single writer task owns the helper's stdin. Requests hand it complete
//! lines over a channel, so a request dropped mid-flight never leaves a
//! partial line on the wire.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::engine::{Engine, EngineProcess, Surface, HARDENED_ARGS};
use crate::page::{PdfOptions, Viewport};
use crate::{PdfError, Result};

/// Helper run with `node -e`; argv is `[node, launchArgsJson, headlessFlag]`.
pub(crate) const HELPER_SCRIPT: &str = r#"
const [, argsJson, headlessFlag] = process.argv;
const readline = require('readline');

function emit(message) {
  process.stdout.write(JSON.stringify(message) + '\n');
}

function describe(err) {
  return {
    name: err && err.name ? err.name : 'Error',
    message: err && err.message ? err.message : String(err)
  };
}

async function main() {
  let browser;
  try {
    const { chromium } = require('playwright');
    browser = await chromium.launch({
      headless: headlessFlag !== '0',
      args: JSON.parse(argsJson)
    });
  } catch (err) {
    emit({ event: 'launchFailed', message: describe(err).message });
    process.exit(1);
  }

  const pages = new Map();
  let nextPage = 1;
  let closing = false;

  browser.on('disconnected', () => {
    emit({ event: 'disconnected' });
    if (!closing) {
      process.exit(1);
    }
  });

  function pageFor(cmd) {
    const page = pages.get(cmd.page);
    if (!page) {
      throw new Error(`unknown page ${cmd.page}`);
    }
    return page;
  }

  const handlers = {
    async newPage() {
      const page = await browser.newPage();
      const id = nextPage++;
      pages.set(id, page);
      return { page: id };
    },
    async setViewport(cmd) {
      await pageFor(cmd).setViewportSize({ width: cmd.width, height: cmd.height });
      return {};
    },
    async setContent(cmd) {
      await pageFor(cmd).setContent(cmd.html, { waitUntil: 'networkidle', timeout: cmd.timeoutMs });
      return {};
    },
    async waitForFunction(cmd) {
      await pageFor(cmd).waitForFunction(cmd.expression, null, { timeout: cmd.timeoutMs });
      return {};
    },
    async pdf(cmd) {
      const buffer = await pageFor(cmd).pdf(cmd.options);
      return { data: buffer.toString('base64') };
    },
    async closePage(cmd) {
      const page = pages.get(cmd.page);
      pages.delete(cmd.page);
      if (page) {
        await page.close();
      }
      return {};
    },
    async close() {
      closing = true;
      await browser.close();
      return {};
    }
  };

  const rl = readline.createInterface({ input: process.stdin });
  rl.on('line', async (line) => {
    if (!line.trim()) {
      return;
    }
    let cmd;
    try {
      cmd = JSON.parse(line);
    } catch (err) {
      emit({ event: 'protocolError', message: describe(err).message });
      return;
    }
    try {
      const handler = handlers[cmd.op];
      if (!handler) {
        throw new Error(`unknown op ${cmd.op}`);
      }
      const result = await handler(cmd);
      emit({ id: cmd.id, ok: true, ...result });
    } catch (err) {
      emit({ id: cmd.id, ok: false, error: describe(err) });
    }
    if (cmd.op === 'close') {
      process.exit(0);
    }
  });
  rl.on('close', async () => {
    if (!closing) {
      closing = true;
      await browser.close().catch(() => {});
    }
    process.exit(0);
  });

  emit({ event: 'ready', version: browser.version() });
}

main();
"#;

/// Timeout for checking node availability.
pub(crate) const NODE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for the helper's `ready` event.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on commands that carry no timeout of their own.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack on top of a timeout the helper enforces itself, so its own
/// `TimeoutError` arrives before ours fires.
const COMMAND_GRACE: Duration = Duration::from_secs(5);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightOptions {
    /// Node.js binary used to run the helper.
    pub node_command: String,
    pub headless: bool,
    /// Appended to the hardened Chromium flags.
    pub extra_args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub launch_timeout: Duration,
}

impl Default for PlaywrightOptions {
    fn default() -> Self {
        Self {
            node_command: "node".to_string(),
            headless: true,
            extra_args: Vec::new(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaywrightEngine {
    options: PlaywrightOptions,
}

impl PlaywrightEngine {
    pub fn new(options: PlaywrightOptions) -> Self {
        Self { options }
    }

    pub fn launch_args(&self) -> Vec<String> {
        HARDENED_ARGS
            .iter()
            .map(|arg| arg.to_string())
            .chain(self.options.extra_args.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Engine for PlaywrightEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>> {
        let node = &self.options.node_command;
        ensure_node_available(node).await?;

        let args = serde_json::to_string(&self.launch_args())?;
        let mut cmd = Command::new(node);
        cmd.arg("-e")
            .arg(HELPER_SCRIPT)
            .arg(args)
            .arg(if self.options.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| map_spawn_error(err, node))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PdfError::launch("engine helper stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PdfError::launch("engine helper stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PdfError::launch("engine helper stderr unavailable"))?;
        let (stderr_tail, stderr_task) = drain_stderr(stderr);

        let mut lines = BufReader::new(stdout).lines();
        let first = tokio::time::timeout(self.options.launch_timeout, lines.next_line())
            .await
            .map_err(|_| {
                PdfError::launch(format!(
                    "engine helper did not become ready within {:?}",
                    self.options.launch_timeout
                ))
            })??;

        let line = match first {
            Some(line) => line,
            None => {
                let _ = child.wait().await;
                let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;
                let tail = stderr_snapshot(&stderr_tail);
                return Err(map_playwright_error(&tail));
            }
        };
        let ready: HelperMessage = serde_json::from_str(&line).map_err(|_| {
            PdfError::launch(format!("unexpected engine helper output: {}", line.trim()))
        })?;
        match ready.event.as_deref() {
            Some("ready") => {
                debug!(version = ready.version.as_deref().unwrap_or("unknown"), "chromium ready");
            }
            Some("launchFailed") => {
                return Err(map_playwright_error(ready.message.as_deref().unwrap_or("")));
            }
            _ => {
                return Err(PdfError::launch(format!(
                    "unexpected engine helper output: {}",
                    line.trim()
                )))
            }
        }

        let shared = HelperShared::spawn(stdin);
        tokio::spawn(read_responses(Arc::downgrade(&shared), lines));
        Ok(Arc::new(PlaywrightProcess {
            shared,
            child: tokio::sync::Mutex::new(child),
        }))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum HelperCommand<'a> {
    NewPage,
    SetViewport {
        page: u64,
        width: u32,
        height: u32,
    },
    #[serde(rename_all = "camelCase")]
    SetContent {
        page: u64,
        html: &'a str,
        timeout_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    WaitForFunction {
        page: u64,
        expression: &'a str,
        timeout_ms: u64,
    },
    Pdf {
        page: u64,
        options: &'a PdfOptions,
    },
    ClosePage {
        page: u64,
    },
    Close,
}

impl HelperCommand<'_> {
    fn name(&self) -> &'static str {
        match self {
            HelperCommand::NewPage => "newPage",
            HelperCommand::SetViewport { .. } => "setViewport",
            HelperCommand::SetContent { .. } => "setContent",
            HelperCommand::WaitForFunction { .. } => "waitForFunction",
            HelperCommand::Pdf { .. } => "pdf",
            HelperCommand::ClosePage { .. } => "closePage",
            HelperCommand::Close => "close",
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(flatten)]
    command: &'a HelperCommand<'a>,
}

#[derive(Debug, Default, Deserialize)]
struct HelperMessage {
    id: Option<u64>,
    event: Option<String>,
    ok: Option<bool>,
    page: Option<u64>,
    data: Option<String>,
    version: Option<String>,
    message: Option<String>,
    error: Option<HelperError>,
}

#[derive(Debug, Deserialize)]
struct HelperError {
    #[serde(default)]
    name: Option<String>,
    message: String,
}

impl HelperMessage {
    fn into_result(self) -> Result<Self> {
        if self.ok == Some(true) {
            return Ok(self);
        }
        Err(match self.error {
            Some(error) => map_helper_error(error.name.as_deref(), &error.message),
            None => PdfError::render("engine helper reported failure without details"),
        })
    }
}

struct HelperShared {
    /// Complete, newline-terminated request lines for the writer task.
    outbox: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HelperMessage>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    disconnected: watch::Sender<bool>,
}

impl HelperShared {
    /// Starts the writer task that owns `stdin`. It stops once every
    /// reference to the returned state is gone.
    fn spawn<W>(stdin: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, requests) = mpsc::unbounded_channel();
        let (disconnected, _) = watch::channel(false);
        let shared = Arc::new(Self {
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            disconnected,
        });
        tokio::spawn(write_requests(Arc::downgrade(&shared), stdin, requests));
        shared
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(true);
        // Dropping the senders fails every in-flight request.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    async fn request(&self, command: &HelperCommand<'_>, timeout: Duration) -> Result<HelperMessage> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PdfError::Disconnected(format!(
                "engine is gone; cannot {}",
                command.name()
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        let _pending = PendingGuard { shared: self, id };

        let mut line = serde_json::to_string(&Request { id, command })?;
        line.push('\n');
        if self.outbox.send(line).is_err() {
            self.mark_disconnected();
            return Err(PdfError::Disconnected(format!(
                "engine helper input is closed; cannot {}",
                command.name()
            )));
        }
        trace!(id, op = command.name(), "engine command queued");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(PdfError::Disconnected(format!(
                "engine exited during {}",
                command.name()
            ))),
            Err(_) => Err(PdfError::timeout(format!(
                "engine did not answer {} within {:?}",
                command.name(),
                timeout
            ))),
        }
    }
}

/// Removes a request's reply slot however the request ends, including when
/// its future is dropped.
struct PendingGuard<'a> {
    shared: &'a HelperShared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.id);
    }
}

async fn write_requests<W>(
    shared: Weak<HelperShared>,
    mut stdin: W,
    mut requests: mpsc::UnboundedReceiver<String>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = requests.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(error = %err, "failed to write to engine helper");
            if let Some(shared) = shared.upgrade() {
                shared.mark_disconnected();
            }
            return;
        }
    }
    debug!("engine helper input closed");
}

/// Holds the shared state weakly so that dropping every handle to the
/// process kills the helper.
async fn read_responses(
    shared: Weak<HelperShared>,
    mut lines: tokio::io::Lines<BufReader<ChildStdout>>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let message: HelperMessage = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(error = %err, "ignoring malformed engine output");
                        continue;
                    }
                };
                if let Some(id) = message.id {
                    let waiter = shared
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(message);
                    }
                    continue;
                }
                match message.event.as_deref() {
                    Some("disconnected") => {
                        debug!("engine reported browser disconnect");
                        shared.mark_disconnected();
                    }
                    Some(other) => debug!(event = other, message = ?message.message, "engine event"),
                    None => {}
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read engine output");
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.mark_disconnected();
    }
    debug!("engine helper output closed");
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

fn drain_stderr(stderr: ChildStderr) -> (StderrTail, JoinHandle<()>) {
    let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let sink = Arc::clone(&tail);
    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "pdfcache::engine", "{line}");
            let mut tail = sink.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
    (tail, task)
}

fn stderr_snapshot(tail: &StderrTail) -> String {
    tail.lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

struct PlaywrightProcess {
    shared: Arc<HelperShared>,
    child: tokio::sync::Mutex<Child>,
}

#[async_trait]
impl EngineProcess for PlaywrightProcess {
    async fn new_page(&self) -> Result<Box<dyn Surface>> {
        let reply = self.shared.request(&HelperCommand::NewPage, COMMAND_TIMEOUT).await?;
        let page = reply
            .page
            .ok_or_else(|| PdfError::render("engine helper did not return a page id"))?;
        Ok(Box::new(PlaywrightPage {
            shared: Arc::clone(&self.shared),
            page,
        }))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.shared.disconnected.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let sent = if self.is_connected() {
            self.shared.request(&HelperCommand::Close, CLOSE_TIMEOUT).await.map(|_| ())
        } else {
            Ok(())
        };
        self.shared.mark_disconnected();

        let mut child = self.child.lock().await;
        if tokio::time::timeout(CLOSE_TIMEOUT, child.wait()).await.is_err() {
            warn!("engine helper did not exit; killing it");
            child.kill().await?;
        }
        match sent {
            Err(PdfError::Disconnected(_)) => Ok(()),
            other => other,
        }
    }
}

struct PlaywrightPage {
    shared: Arc<HelperShared>,
    page: u64,
}

#[async_trait]
impl Surface for PlaywrightPage {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        let command = HelperCommand::SetViewport {
            page: self.page,
            width: viewport.width,
            height: viewport.height,
        };
        self.shared.request(&command, COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn set_content(&mut self, html: &str, timeout: Duration) -> Result<()> {
        let command = HelperCommand::SetContent {
            page: self.page,
            html,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.shared
            .request(&command, timeout + COMMAND_GRACE)
            .await
            .map(|_| ())
    }

    async fn wait_for_condition(&mut self, expression: &str, timeout: Duration) -> Result<()> {
        let command = HelperCommand::WaitForFunction {
            page: self.page,
            expression,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.shared
            .request(&command, timeout + COMMAND_GRACE)
            .await
            .map(|_| ())
    }

    async fn export_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>> {
        let command = HelperCommand::Pdf {
            page: self.page,
            options,
        };
        let reply = self.shared.request(&command, COMMAND_TIMEOUT).await?;
        let data = reply
            .data
            .ok_or_else(|| PdfError::render("engine returned no PDF data"))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| PdfError::render(format!("engine returned undecodable PDF data: {err}")))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let command = HelperCommand::ClosePage { page: self.page };
        match self.shared.request(&command, COMMAND_TIMEOUT).await {
            Err(PdfError::Disconnected(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

/// Maps a spawn error to an appropriate PdfError.
pub(crate) fn map_spawn_error(err: io::Error, command: &str) -> PdfError {
    if err.kind() == io::ErrorKind::NotFound {
        PdfError::Launch(format!(
            "Unable to spawn Playwright helper; '{}' was not found on PATH",
            command
        ))
    } else {
        PdfError::Io(err)
    }
}

/// Maps helper launch output (a `launchFailed` message or stderr) to a launch error.
pub(crate) fn map_playwright_error(output: &str) -> PdfError {
    let lower = output.to_ascii_lowercase();

    if lower.contains("cannot find module 'playwright'") {
        return PdfError::Launch(
            "Playwright npm package is missing; install with `npm install playwright`.".to_string(),
        );
    }

    if lower.contains("executable doesn't exist") {
        return PdfError::Launch(format!(
            "Chromium executable for Playwright is not installed: {}",
            output.trim()
        ));
    }

    if output.trim().is_empty() {
        return PdfError::Launch("engine helper exited before becoming ready".to_string());
    }

    PdfError::Launch(format!("Playwright could not start Chromium: {}", output.trim()))
}

/// Maps an error reported for a single command.
pub(crate) fn map_helper_error(name: Option<&str>, message: &str) -> PdfError {
    let lower = message.to_ascii_lowercase();
    if name == Some("TimeoutError") || (lower.contains("timeout") && lower.contains("exceeded")) {
        PdfError::Timeout(message.to_string())
    } else if lower.contains("has been closed")
        || lower.contains("target closed")
        || lower.contains("browser has disconnected")
    {
        PdfError::Disconnected(message.to_string())
    } else {
        PdfError::Render(message.to_string())
    }
}

/// Ensures Node.js is available on the system.
pub(crate) async fn ensure_node_available(node_command: &str) -> Result<()> {
    let mut cmd = Command::new(node_command);
    cmd.arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let status = tokio::time::timeout(NODE_CHECK_TIMEOUT, cmd.status())
        .await
        .map_err(|_| {
            PdfError::Launch(format!(
                "Timed out checking node availability after {:?}",
                NODE_CHECK_TIMEOUT
            ))
        })?
        .map_err(|err| map_spawn_error(err, node_command))?;

    if !status.success() {
        return Err(PdfError::Launch(format!(
            "Node command {:?} is not available (exit {})",
            node_command, status
        )));
    }

    Ok(())
}
