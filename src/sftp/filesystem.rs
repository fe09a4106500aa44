//! SFTP requests served from a [`VirtualRoot`]

use crate::vfs::VirtualRoot;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Largest chunk returned by a single `read`.
const MAX_READ_LEN: u32 = 256 * 1024;

enum OpenHandle {
    File(tokio::fs::File),
    Dir { path: PathBuf, listed: bool },
}

/// One SFTP session's open handles over a shared root.
pub struct SftpHandler {
    root: VirtualRoot,
    version: Option<u32>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpHandler {
    #[must_use]
    pub fn new(root: VirtualRoot) -> Self {
        Self {
            root,
            version: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn real(&self, path: &str) -> PathBuf {
        self.root.resolve("/", path).1
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = self.next_handle.to_string();
        self.handles.insert(id.clone(), handle);
        id
    }

    fn file(&mut self, handle: &str) -> Result<&mut tokio::fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn status_code(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn failed(op: &str, path: &str, e: &io::Error) -> StatusCode {
    debug!("SFTP {} {} failed: {}", op, path, e);
    status_code(e)
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            warn!("Duplicate SFTP init packet");
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        debug!("SFTP client version {}", version);
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(VirtualRoot::normalize("/", &path))],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::metadata(self.real(&path))
            .await
            .map_err(|e| failed("stat", &path, &e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::symlink_metadata(self.real(&path))
            .await
            .map_err(|e| failed("lstat", &path, &e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let meta = match self.handles.get(&handle) {
            Some(OpenHandle::File(file)) => file.metadata().await,
            Some(OpenHandle::Dir { path, .. }) => tokio::fs::metadata(path).await,
            None => return Err(StatusCode::Failure),
        }
        .map_err(|e| failed("fstat", &handle, &e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let real = self.real(&path);
        let meta = tokio::fs::metadata(&real)
            .await
            .map_err(|e| failed("opendir", &path, &e))?;
        if !meta.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }
        let handle = self.insert(OpenHandle::Dir {
            path: real,
            listed: false,
        });
        Ok(Handle { id, handle })
    }

    /// The whole directory is read on the first call; the next call
    /// reports end of listing.
    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir { path, listed }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        if *listed {
            return Err(StatusCode::Eof);
        }
        *listed = true;

        let mut files = Vec::new();
        let mut reader = tokio::fs::read_dir(&*path)
            .await
            .map_err(|e| failed("readdir", &handle, &e))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| failed("readdir", &handle, &e))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            files.push(File::new(
                entry.file_name().to_string_lossy().into_owned(),
                FileAttributes::from(&meta),
            ));
        }
        Ok(Name { id, files })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let create = pflags.contains(OpenFlags::CREATE);
        let exclusive = pflags.contains(OpenFlags::EXCLUDE);
        let append = pflags.contains(OpenFlags::APPEND);

        let file = tokio::fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE) || append)
            .append(append)
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .create(create && !exclusive)
            .create_new(create && exclusive)
            .open(self.real(&filename))
            .await
            .map_err(|e| failed("open", &filename, &e))?;

        debug!("SFTP open {} ({:?})", filename, pflags);
        let handle = self.insert(OpenHandle::File(file));
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| status_code(&e))?;

        let mut data = vec![0; len.min(MAX_READ_LEN) as usize];
        let n = file.read(&mut data).await.map_err(|e| status_code(&e))?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| status_code(&e))?;
        file.write_all(&data).await.map_err(|e| status_code(&e))?;
        Ok(ok(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File(mut file)) => {
                file.flush().await.map_err(|e| status_code(&e))?;
                Ok(ok(id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(self.real(&filename))
            .await
            .map_err(|e| failed("remove", &filename, &e))?;
        Ok(ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(self.real(&path))
            .await
            .map_err(|e| failed("mkdir", &path, &e))?;
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        if VirtualRoot::normalize("/", &path) == "/" {
            return Err(StatusCode::PermissionDenied);
        }
        tokio::fs::remove_dir(self.real(&path))
            .await
            .map_err(|e| failed("rmdir", &path, &e))?;
        Ok(ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(self.real(&oldpath), self.real(&newpath))
            .await
            .map_err(|e| failed("rename", &oldpath, &e))?;
        Ok(ok(id))
    }
}
