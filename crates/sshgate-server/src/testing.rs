//! In-memory stand-ins for the remote side, used by unit tests.

use crate::session::{RemoteHost, ShellHandle, ShellInput};
use crate::transfer::{RemoteAttrs, RemoteEntry, RemoteFs, RemoteWriter};
use async_trait::async_trait;
use sshgate_core::{GateError, GateResult};
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Link(String),
}

type Tree = Arc<Mutex<BTreeMap<String, Node>>>;

/// A filesystem held in a map of absolute paths.
pub struct MemFs {
    home: String,
    nodes: Tree,
    broken: AtomicBool,
}

impl MemFs {
    pub fn new(home: &str) -> Self {
        let fs = Self {
            home: home.to_string(),
            nodes: Arc::new(Mutex::new(BTreeMap::new())),
            broken: AtomicBool::new(false),
        };
        fs.add_dir(home);
        fs
    }

    /// Create a directory and its ancestors.
    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        for dir in ancestors_and_self(path) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
    }

    /// Create a file and its parent directories.
    pub fn add_file(&self, path: &str, bytes: &[u8]) {
        let path = normalize(path);
        self.add_dir(parent_of(&path));
        self.nodes
            .lock()
            .unwrap()
            .insert(path, Node::File(bytes.to_vec()));
    }

    /// Make the channel report itself unusable.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Create a symbolic link at `path` pointing to `target`.
    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        self.add_dir(parent_of(&path));
        self.nodes
            .lock()
            .unwrap()
            .insert(path, Node::Link(target.to_string()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(&normalize(path)) {
            Some(Node::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn node(&self, path: &str) -> GateResult<Node> {
        self.nodes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| GateError::Transfer(format!("{path}: no such file")))
    }

    /// Follow links the way a server-side stat does.
    fn resolve(&self, path: &str) -> GateResult<(String, Node)> {
        let mut path = normalize(path);
        for _ in 0..8 {
            match self.node(&path)? {
                Node::Link(target) => path = normalize(&target),
                node => return Ok((path, node)),
            }
        }
        Err(GateError::Transfer(format!("{path}: too many levels of links")))
    }
}

#[async_trait]
impl RemoteFs for MemFs {
    async fn canonicalize(&self, path: &str) -> GateResult<String> {
        let absolute = if path.starts_with('/') {
            normalize(path)
        } else {
            normalize(&format!("{}/{path}", self.home))
        };
        self.node(&absolute)?;
        Ok(absolute)
    }

    async fn read_dir(&self, path: &str) -> GateResult<Vec<RemoteEntry>> {
        let (dir, node) = self.resolve(path)?;
        if !matches!(node, Node::Dir) {
            return Err(GateError::Transfer(format!("{dir}: not a directory")));
        }
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == dir)
            .map(|(p, node)| RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                attrs: attrs_of(node),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> GateResult<RemoteAttrs> {
        Ok(attrs_of(&self.resolve(path)?.1))
    }

    async fn read_file(&self, path: &str) -> GateResult<Vec<u8>> {
        match self.resolve(path)?.1 {
            Node::File(bytes) => Ok(bytes),
            _ => Err(GateError::Transfer(format!("{path}: is a directory"))),
        }
    }

    async fn create(&self, path: &str) -> GateResult<RemoteWriter> {
        let path = normalize(path);
        match self.resolve(parent_of(&path))?.1 {
            Node::Dir => Ok(Box::new(MemWriter {
                path,
                buf: Vec::new(),
                nodes: self.nodes.clone(),
            })),
            _ => Err(GateError::Transfer(format!("{path}: parent is a file"))),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

fn attrs_of(node: &Node) -> RemoteAttrs {
    match node {
        Node::Dir => RemoteAttrs {
            is_dir: true,
            size: 4096,
            mtime: 0,
            permissions: Some(0o040755),
        },
        Node::File(bytes) => RemoteAttrs {
            is_dir: false,
            size: bytes.len() as u64,
            mtime: 0,
            permissions: Some(0o100644),
        },
        Node::Link(target) => RemoteAttrs {
            is_dir: false,
            size: target.len() as u64,
            mtime: 0,
            permissions: Some(0o120777),
        },
    }
}

/// Buffers writes and commits the file on shutdown.
struct MemWriter {
    path: String,
    buf: Vec<u8>,
    nodes: Tree,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.nodes
            .lock()
            .unwrap()
            .insert(this.path.clone(), Node::File(std::mem::take(&mut this.buf)));
        Poll::Ready(Ok(()))
    }
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn ancestors_and_self(path: &str) -> Vec<String> {
    let path = normalize(path);
    let mut out = vec!["/".to_string()];
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

/// A remote host with a scripted shell, canned command output and a
/// [`MemFs`] behind its file channels.
pub struct FakeHost {
    shell: ShellHandle,
    shell_input: Mutex<Option<mpsc::Receiver<ShellInput>>>,
    output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    fs: Arc<MemFs>,
    replies: Vec<(String, String)>,
    exec_log: Mutex<Vec<String>>,
    fresh_channels: AtomicUsize,
    closes: AtomicUsize,
}

pub struct FakeHostBuilder {
    home: String,
    replies: Vec<(String, String)>,
    fs: Option<Arc<MemFs>>,
}

impl FakeHostBuilder {
    pub fn fs(mut self, fs: Arc<MemFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Answer any command containing `needle` with `stdout`.
    pub fn exec_reply(mut self, needle: &str, stdout: &str) -> Self {
        self.replies.push((needle.to_string(), stdout.to_string()));
        self
    }

    pub fn build(self) -> Arc<FakeHost> {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (output_tx, output_rx) = mpsc::channel(256);
        let fs = self
            .fs
            .unwrap_or_else(|| Arc::new(MemFs::new(&self.home)));
        Arc::new(FakeHost {
            shell: ShellHandle::new(input_tx),
            shell_input: Mutex::new(Some(input_rx)),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
            fs,
            replies: self.replies,
            exec_log: Mutex::new(Vec::new()),
            fresh_channels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }
}

impl FakeHost {
    pub fn builder() -> FakeHostBuilder {
        FakeHostBuilder {
            home: "/home/u".into(),
            replies: Vec::new(),
            fs: None,
        }
    }

    pub fn fs(&self) -> &Arc<MemFs> {
        &self.fs
    }

    /// What the gateway sent to the shell.
    pub fn take_shell_input(&self) -> mpsc::Receiver<ShellInput> {
        self.shell_input.lock().unwrap().take().expect("shell input already taken")
    }

    /// Emit bytes as if the remote shell printed them.
    pub async fn print(&self, bytes: &[u8]) {
        let tx = self.output_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(bytes.to_vec()).await;
        }
    }

    /// End the shell stream, as when the connection drops.
    pub fn hang_up(&self) {
        self.output_tx.lock().unwrap().take();
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.exec_log.lock().unwrap().clone()
    }

    pub fn fresh_channels(&self) -> usize {
        self.fresh_channels.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteHost for FakeHost {
    fn shell(&self) -> ShellHandle {
        self.shell.clone()
    }

    fn take_shell_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().unwrap().take()
    }

    async fn file_channel(&self) -> GateResult<Arc<dyn RemoteFs>> {
        Ok(self.fs.clone())
    }

    async fn open_file_channel(&self) -> GateResult<Arc<dyn RemoteFs>> {
        self.fresh_channels.fetch_add(1, Ordering::SeqCst);
        Ok(self.fs.clone())
    }

    async fn exec(&self, command: &str) -> GateResult<String> {
        self.exec_log.lock().unwrap().push(command.to_string());
        self.replies
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .ok_or_else(|| GateError::Channel(format!("no reply scripted for {command:?}")))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.hang_up();
    }
}
