//! File-system protocol server: one worker task per accepted connection,
//! each owning a current-folder handle and a canonical path string. Sync
//! [`FileSystem`] calls run on `spawn_blocking` since they hold plain
//! `std::sync::Mutex`es and would otherwise hold up the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use wire::fsproto::{
    FsErrorCode, FsReply, FsRequest, FsServerCodec, GREETING_CONNECTED_NO_FORMAT, GREETING_CONNECTED_OK,
};

use crate::error::{FsError, VdfsError};
use crate::fs::{FileSystem, FolderHandle};

pub struct FsServer {
    fs: Arc<FileSystem>,
    terminate: AtomicBool,
}

impl FsServer {
    pub fn new(fs: Arc<FileSystem>) -> Arc<Self> {
        Arc::new(Self { fs, terminate: AtomicBool::new(false) })
    }

    /// Sets the terminate flag observed by workers at command boundaries.
    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub async fn serve(self: Arc<Self>, port: u16) -> crate::error::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| VdfsError::Io { context: format!("binding fs server on port {port}"), source: e })?;
        info!(port, "file system server listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            info!(%peer, "fs client connected");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    warn!(%peer, error = %e, "fs connection ended with error");
                } else {
                    debug!(%peer, "fs client disconnected");
                }
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, mut stream: TcpStream) -> crate::error::Result<()> {
        let formatted = {
            let fs = self.fs.clone();
            tokio::task::spawn_blocking(move || fs.is_formatted())
                .await
                .expect("blocking task panicked")?
        };
        let greeting = if formatted { GREETING_CONNECTED_OK } else { GREETING_CONNECTED_NO_FORMAT };
        stream
            .write_u8(greeting)
            .await
            .map_err(|e| VdfsError::Io { context: "sending connection greeting".into(), source: e })?;

        let mut framed = Framed::new(stream, FsServerCodec);
        let mut current = self.fs.root_folder();
        let mut path = String::from("/");

        loop {
            if self.terminate.load(Ordering::SeqCst) {
                return Ok(());
            }
            let req = match framed.next().await {
                Some(Ok(req)) => req,
                Some(Err(e)) => {
                    warn!(error = %e, "fs protocol error");
                    return Ok(());
                }
                None => return Ok(()),
            };

            let reply = self.dispatch(&mut current, &mut path, req).await?;
            if framed.send(reply).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        current: &mut FolderHandle,
        path: &mut String,
        req: FsRequest,
    ) -> crate::error::Result<FsReply> {
        let fs = self.fs.clone();
        match req {
            FsRequest::Cd { name } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.open_folder(&name).map(|h| (h, name)))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |(handle, name)| {
                    apply_cd(path, &name);
                    *current = handle;
                    FsReply::OkPath(path.clone())
                })
            }
            FsRequest::Ls => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.list()).await.expect("blocking task panicked");
                into_reply(result, FsReply::OkList)
            }
            FsRequest::Mk { name } => {
                let folder = current.clone();
                let result =
                    tokio::task::spawn_blocking(move || folder.create(&name, false)).await.expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Mkdir { name } => {
                let folder = current.clone();
                let result =
                    tokio::task::spawn_blocking(move || folder.create(&name, true)).await.expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Rm { name } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.remove(&name, false, false))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Rmdir { name } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.remove(&name, true, false))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Cat { name } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.open(&name)?.read_all())
                    .await
                    .expect("blocking task panicked");
                into_reply(result, FsReply::OkData)
            }
            FsRequest::Write { name, data } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.open(&name)?.write_all(&data))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Insert { name, pos, data } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.open(&name)?.insert(pos, &data))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Delete { name, pos, len } => {
                let folder = current.clone();
                let result = tokio::task::spawn_blocking(move || folder.open(&name)?.erase(pos, len))
                    .await
                    .expect("blocking task panicked");
                into_reply(result, |_| FsReply::Ok)
            }
            FsRequest::Format => {
                tokio::task::spawn_blocking(move || fs.format()).await.expect("blocking task panicked")?;
                Ok(FsReply::Ok)
            }
        }
    }
}

/// Semantic file-system errors become a reply without closing the
/// connection; any other error (transport, unexpected) propagates out of
/// `dispatch` and terminates the worker.
fn into_reply<T>(result: crate::error::Result<T>, ok: impl FnOnce(T) -> FsReply) -> crate::error::Result<FsReply> {
    match result {
        Ok(v) => Ok(ok(v)),
        Err(VdfsError::Fs(e)) => Ok(FsReply::Err(fs_error_code(&e))),
        Err(other) => Err(other),
    }
}

/// `"."` leaves `path` unchanged; `".."` pops the last component (unless
/// already at root); any other name appends `name + "/"`.
fn apply_cd(path: &mut String, name: &str) {
    match name {
        "." => {}
        ".." => {
            if path != "/" {
                let trimmed = path.trim_end_matches('/');
                match trimmed.rfind('/') {
                    Some(idx) => path.truncate(idx + 1),
                    None => *path = "/".to_string(),
                }
            }
        }
        other => {
            path.push_str(other);
            path.push('/');
        }
    }
}

fn fs_error_code(err: &FsError) -> FsErrorCode {
    match err {
        FsError::NameNotExist { .. } => FsErrorCode::NotExist,
        FsError::NameAlreadyExist { .. } => FsErrorCode::AlreadyExist,
        FsError::NameTooLong { .. } => FsErrorCode::NameTooLong,
        FsError::NameInvalid { .. } => FsErrorCode::NameInvalid,
        FsError::BusyHandle { .. } => FsErrorCode::BusyHandle,
        FsError::CapacityExceeded => FsErrorCode::CapacityExceeded,
        FsError::AccessDenied => FsErrorCode::AccessDenied,
        FsError::NotEmpty { .. } => FsErrorCode::NotEmpty,
        FsError::NotFormatted => FsErrorCode::Unknown,
    }
}
