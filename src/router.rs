use crate::config::{RouteConfig, ServerConfig};
use crate::http::Method;

#[derive(Debug)]
pub enum RouteMatch<'a> {
    Static(&'a RouteConfig),
    Upstream { route: &'a RouteConfig, backend: String },
    MethodNotAllowed(&'a RouteConfig),
}

/// Longest-prefix-match routing. Ties broken by declaration order, so
/// routes are effectively first-match-wins within a shared prefix length.
pub fn route<'a>(server: &'a ServerConfig, uri: &str, method: &Method) -> Option<RouteMatch<'a>> {
    let path = uri.split('?').next().unwrap_or(uri);

    let best = server
        .routes
        .iter()
        .filter(|r| path.starts_with(r.path.as_str()))
        .max_by_key(|r| r.path.len())?;

    if !method.is_allowed(&best.methods) {
        return Some(RouteMatch::MethodNotAllowed(best));
    }

    match &best.upstream {
        Some(backend) => Some(RouteMatch::Upstream {
            route: best,
            backend: backend.clone(),
        }),
        None => Some(RouteMatch::Static(best)),
    }
}

/// Picks the server block for a request's `Host` header, falling back to
/// the configured default, then the first server (spec §4.12 virtual-host
/// resolution).
pub fn select_server<'a>(servers: &'a [ServerConfig], host_header: Option<&str>) -> Option<&'a ServerConfig> {
    if let Some(host) = host_header {
        let hostname = host.split(':').next().unwrap_or(host);
        if let Some(s) = servers.iter().find(|s| s.server_name == hostname) {
            return Some(s);
        }
    }
    servers
        .iter()
        .find(|s| s.default_server)
        .or_else(|| servers.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn server_with_routes(routes: Vec<RouteConfig>) -> ServerConfig {
        ServerConfig {
            routes,
            ..Default::default()
        }
    }

    fn route_at(path: &str) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn picks_longest_matching_prefix() {
        let server = server_with_routes(vec![route_at("/"), route_at("/api/v1")]);
        let m = route(&server, "/api/v1/users", &Method::Get).unwrap();
        match m {
            RouteMatch::Static(r) => assert_eq!(r.path, "/api/v1"),
            _ => panic!("expected a static match"),
        }
    }

    #[test]
    fn disallowed_method_is_flagged() {
        let mut r = route_at("/");
        r.methods = vec!["GET".to_string()];
        let server = server_with_routes(vec![r]);
        let m = route(&server, "/", &Method::Post).unwrap();
        assert!(matches!(m, RouteMatch::MethodNotAllowed(_)));
    }

    #[test]
    fn upstream_route_is_distinguished_from_static() {
        let mut r = route_at("/app");
        r.upstream = Some("appsrv".to_string());
        let server = server_with_routes(vec![r]);
        let m = route(&server, "/app/x", &Method::Get).unwrap();
        assert!(matches!(m, RouteMatch::Upstream { .. }));
    }

    #[test]
    fn select_server_prefers_host_match_over_default() {
        let mut a = ServerConfig::default();
        a.server_name = "a.test".to_string();
        let mut b = ServerConfig::default();
        b.server_name = "b.test".to_string();
        b.default_server = true;
        let servers = vec![a, b];
        let picked = select_server(&servers, Some("a.test:8080")).unwrap();
        assert_eq!(picked.server_name, "a.test");
    }
}
