use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::net::{Body, Method, RawFetch, Request, Response};
use crate::task::{Scheduler, Task};
use crate::utils::strip_fragment;

/// Serves requests from a directory on the local filesystem. Reads happen
/// synchronously, so the returned task is already complete.
#[derive(Debug, Clone)]
pub struct FileFetch {
    root: Utf8PathBuf,
}

impl FileFetch {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Maps a URL onto a path below the root directory. `None` for URLs that
    /// climb out of it.
    pub fn resolve(&self, url: &str) -> Option<Utf8PathBuf> {
        resolve(&self.root, url)
    }
}

impl RawFetch for FileFetch {
    fn fetch(&self, scheduler: &Scheduler, request: Request) -> Task<Response> {
        if request.method == Method::Post {
            return Task::ready(scheduler, Response::new(request.url, 405, Body::Empty));
        }

        let Some(path) = self.resolve(&request.url) else {
            return Task::ready(scheduler, outside_root(request.url));
        };
        tracing::debug!(%path, "reading file");

        let response = into_response(request.url, request.binary, std::fs::read(&path));
        Task::ready(scheduler, response)
    }
}

pub(crate) fn resolve(root: &Utf8Path, url: &str) -> Option<Utf8PathBuf> {
    let url = strip_fragment(url);
    let path = url.strip_prefix("file://").unwrap_or(url);
    let path = Utf8Path::new(path.split('?').next().unwrap_or_default().trim_start_matches('/'));

    if path
        .components()
        .any(|component| !matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir))
    {
        return None;
    }

    Some(root.join(path))
}

pub(crate) fn outside_root(url: String) -> Response {
    tracing::warn!(%url, "refusing to read outside the root directory");
    Response::new(url, 403, Body::Empty)
}

/// Builds the response for a finished read. Status `0` marks local success.
pub(crate) fn into_response(url: String, binary: bool, read: io::Result<Vec<u8>>) -> Response {
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(err) => {
            let status = match err.kind() {
                io::ErrorKind::NotFound => 404,
                io::ErrorKind::PermissionDenied => 403,
                _ => 500,
            };
            tracing::warn!(%url, error = %err, status, "failed to read file");
            return Response::new(url, status, Body::Empty);
        }
    };

    if binary {
        return Response::new(url, 0, Body::Binary(bytes));
    }

    match String::from_utf8(bytes) {
        Ok(text) => Response::new(url, 0, Body::Text(text)),
        Err(err) => {
            tracing::warn!(%url, error = %err, "file is not valid UTF-8");
            Response::new(url, 500, Body::Empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join(format!("shiori-{name}-{}", std::process::id()));
        let dir = Utf8PathBuf::from_path_buf(dir).unwrap();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_resolve_stays_below_root() {
        let root = Utf8Path::new("/srv/book");
        let resolved = |url: &str| resolve(root, url).map(|path| path.to_string());

        assert_eq!(resolved("OPS/ch1.xhtml#p3").as_deref(), Some("/srv/book/OPS/ch1.xhtml"));
        assert_eq!(resolved("file:///OPS/ch1.xhtml").as_deref(), Some("/srv/book/OPS/ch1.xhtml"));
        assert_eq!(resolved("style.css?v=2").as_deref(), Some("/srv/book/style.css"));
        assert_eq!(resolved("./OPS/./nav.xhtml").as_deref(), Some("/srv/book/OPS/nav.xhtml"));
        assert_eq!(resolved("../secret.txt"), None);
        assert_eq!(resolved("OPS/../../secret.txt"), None);
        assert_eq!(resolved("file:///../etc/passwd"), None);
    }

    #[test]
    fn test_refuses_files_outside_root() {
        let parent = scratch_dir("escape");
        let root = parent.join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(parent.join("secret.txt"), "outside").unwrap();

        let scheduler = Scheduler::new();
        let fetch = FileFetch::new(root.clone());

        let response = scheduler
            .block_on(fetch.fetch(&scheduler, Request::get("../secret.txt")))
            .unwrap();
        assert_eq!(response.status, 403);
        assert!(response.body.is_empty());

        fs::remove_dir_all(&parent).unwrap();
    }

    #[test]
    fn test_reads_text_and_binary() {
        let dir = scratch_dir("read");
        fs::write(dir.join("doc.xml"), "<doc/>").unwrap();
        fs::write(dir.join("blob.bin"), [0xff, 0x00, 0xfe]).unwrap();

        let scheduler = Scheduler::new();
        let fetch = FileFetch::new(dir.clone());

        let text = scheduler.block_on(fetch.fetch(&scheduler, Request::get("doc.xml"))).unwrap();
        assert!(text.is_success());
        assert_eq!(text.status, 0);
        assert_eq!(text.body.as_text(), Some("<doc/>"));

        let blob = scheduler
            .block_on(fetch.fetch(&scheduler, Request::get("blob.bin").binary(true)))
            .unwrap();
        assert_eq!(blob.body, Body::Binary(vec![0xff, 0x00, 0xfe]));

        let garbled = scheduler.block_on(fetch.fetch(&scheduler, Request::get("blob.bin"))).unwrap();
        assert_eq!(garbled.status, 500);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_error_statuses() {
        let dir = scratch_dir("status");
        let scheduler = Scheduler::new();
        let fetch = FileFetch::new(dir.clone());

        let missing = scheduler.block_on(fetch.fetch(&scheduler, Request::get("nope.xml"))).unwrap();
        assert_eq!(missing.status, 404);
        assert!(!missing.is_success());

        let post = scheduler.block_on(fetch.fetch(&scheduler, Request::post("doc.xml", "{}"))).unwrap();
        assert_eq!(post.status, 405);

        fs::remove_dir_all(&dir).unwrap();
    }
}
