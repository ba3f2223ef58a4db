use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::RouteConfig;
use crate::http::{HttpResponse, Method, generate_autoindex, mime_type_for};

/// Resolves `uri` against `route.root`, stripping the route's mount
/// prefix and rejecting any `..` component so a request can't escape the
/// document root.
fn resolve_path(route: &RouteConfig, uri: &str) -> Option<PathBuf> {
    let path = uri.split('?').next().unwrap_or(uri);
    let relative = path.strip_prefix(route.path.as_str()).unwrap_or(path);
    let relative = relative.trim_start_matches('/');

    let candidate = Path::new(relative);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return None;
    }

    Some(Path::new(&route.root).join(candidate))
}

/// Direct GET/HEAD/DELETE handler for routes with no `upstream`. HEAD
/// responses carry the same headers as GET with an empty body.
pub fn serve_static(route: &RouteConfig, method: &Method, uri: &str) -> HttpResponse {
    let Some(mut target) = resolve_path(route, uri) else {
        return HttpResponse::new(403);
    };

    match method {
        Method::Get | Method::Head => {
            let metadata = match fs::metadata(&target) {
                Ok(m) => m,
                Err(_) => return HttpResponse::new(404),
            };

            if metadata.is_dir() {
                let index = target.join(&route.default_file);
                if index.is_file() {
                    target = index;
                } else if route.autoindex {
                    return generate_autoindex(&target, uri);
                } else {
                    return HttpResponse::new(403);
                }
            }

            let content = match fs::read(&target) {
                Ok(c) => c,
                Err(_) => return HttpResponse::new(404),
            };

            let ext = target.extension().and_then(|e| e.to_str());
            let mut res = HttpResponse::new(200);
            if *method == Method::Head {
                res.set_header("Content-Length", content.len().to_string());
                res.set_header("Content-Type", mime_type_for(ext));
            } else {
                res.set_body(content, mime_type_for(ext));
            }
            res
        }
        Method::Delete => match fs::remove_file(&target) {
            Ok(()) => HttpResponse::new(204),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HttpResponse::new(404),
            Err(_) => HttpResponse::new(403),
        },
        _ => HttpResponse::new(405),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn route_at(root: &str) -> RouteConfig {
        RouteConfig {
            path: "/".to_string(),
            root: root.to_string(),
            default_file: "index.html".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn serves_existing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        let route = route_at(dir.path().to_str().unwrap());
        let res = serve_static(&route, &Method::Get, "/hello.txt");
        assert_eq!(res.status_code, 200);
    }

    #[test]
    fn missing_file_is_404() {
        let dir = tempdir().unwrap();
        let route = route_at(dir.path().to_str().unwrap());
        let res = serve_static(&route, &Method::Get, "/nope.txt");
        assert_eq!(res.status_code, 404);
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let route = route_at(dir.path().to_str().unwrap());
        let res = serve_static(&route, &Method::Get, "/../../etc/passwd");
        assert_eq!(res.status_code, 403);
    }

    #[test]
    fn directory_without_index_or_autoindex_is_forbidden() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let route = route_at(dir.path().to_str().unwrap());
        let res = serve_static(&route, &Method::Get, "/sub");
        assert_eq!(res.status_code, 403);
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        let route = route_at(dir.path().to_str().unwrap());
        let res = serve_static(&route, &Method::Delete, "/gone.txt");
        assert_eq!(res.status_code, 204);
        assert!(!dir.path().join("gone.txt").exists());
    }
}
