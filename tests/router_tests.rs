use halcyon_httpd::config::{RouteConfig, ServerConfig};
use halcyon_httpd::http::Method;
use halcyon_httpd::router::{self, RouteMatch};

fn route_at(path: &str, methods: &[&str]) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    }
}

fn server_with_routes(routes: Vec<RouteConfig>) -> ServerConfig {
    ServerConfig {
        routes,
        ..Default::default()
    }
}

#[test]
fn test_router_simple_match() {
    let server = server_with_routes(vec![route_at("/", &["GET"])]);
    let m = router::route(&server, "/", &Method::Get).unwrap();
    match m {
        RouteMatch::Static(r) => assert_eq!(r.path, "/"),
        _ => panic!("expected a static match"),
    }
}

#[test]
fn test_router_root_catches_unconfigured_paths() {
    let server = server_with_routes(vec![route_at("/", &["GET"])]);
    let m = router::route(&server, "/unconfigured", &Method::Get).unwrap();
    assert!(matches!(m, RouteMatch::Static(_)));
}

#[test]
fn test_router_longest_prefix_match() {
    let server = server_with_routes(vec![route_at("/a", &["GET"]), route_at("/a/b", &["GET"])]);
    let m = router::route(&server, "/a/b/c", &Method::Get).unwrap();
    match m {
        RouteMatch::Static(r) => assert_eq!(r.path, "/a/b"),
        _ => panic!("expected a static match"),
    }
}

#[test]
fn test_router_method_not_allowed() {
    let server = server_with_routes(vec![route_at("/", &["GET"])]);
    let m = router::route(&server, "/", &Method::Post).unwrap();
    assert!(matches!(m, RouteMatch::MethodNotAllowed(_)));
}

#[test]
fn test_router_no_route_at_all_is_none() {
    let server = server_with_routes(vec![route_at("/a", &["GET"])]);
    assert!(router::route(&server, "/b", &Method::Get).is_none());
}

#[test]
fn test_select_server_falls_back_to_default_server() {
    let mut a = ServerConfig {
        server_name: "a.test".to_string(),
        ..Default::default()
    };
    a.default_server = false;
    let b = ServerConfig {
        server_name: "b.test".to_string(),
        default_server: true,
        ..Default::default()
    };
    let servers = vec![a, b];
    let picked = router::select_server(&servers, Some("unknown.test")).unwrap();
    assert_eq!(picked.server_name, "b.test");
}

#[test]
fn test_select_server_falls_back_to_first_when_no_default() {
    let a = ServerConfig {
        server_name: "a.test".to_string(),
        ..Default::default()
    };
    let b = ServerConfig {
        server_name: "b.test".to_string(),
        ..Default::default()
    };
    let servers = vec![a, b];
    let picked = router::select_server(&servers, None).unwrap();
    assert_eq!(picked.server_name, "a.test");
}
