use std::rc::Rc;

use crate::error::Result;
use crate::vr::VRequest;

/// A condition tested against the virtual request when walking an action
/// list (spec §9 design note): conditions gate settings and handlers as
/// data instead of a parsed config AST.
pub enum Condition {
    HostEquals(String),
    PathPrefix(String),
    MethodIs(String),
}

impl Condition {
    pub fn matches(&self, vr: &VRequest) -> bool {
        match self {
            Condition::HostEquals(host) => vr
                .request
                .header("host")
                .map(|h| h.split(':').next().unwrap_or("") == host)
                .unwrap_or(false),
            Condition::PathPrefix(prefix) => vr.request.uri.starts_with(prefix.as_str()),
            Condition::MethodIs(method) => vr.request.method.as_str() == method,
        }
    }
}

pub type HandlerFn = Rc<dyn Fn(&mut VRequest) -> Result<()>>;

/// One node of an action list: either a static setting applied to the
/// request context, an opaque handler function, or a conditional branch
/// (spec §9).
pub enum Action {
    Setting { key: String, value: String },
    Function(HandlerFn),
    Condition {
        cond: Condition,
        then_branch: Vec<Action>,
        else_branch: Vec<Action>,
    },
}

impl Action {
    pub fn run(&self, vr: &mut VRequest) -> Result<()> {
        match self {
            Action::Setting { key, value } => {
                vr.settings.insert(key.clone(), value.clone());
                Ok(())
            }
            Action::Function(f) => f(vr),
            Action::Condition {
                cond,
                then_branch,
                else_branch,
            } => {
                let branch = if cond.matches(vr) { then_branch } else { else_branch };
                run_list(branch, vr)
            }
        }
    }
}

pub fn run_list(actions: &[Action], vr: &mut VRequest) -> Result<()> {
    for action in actions {
        action.run(vr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpVersion, Method};

    fn sample_vr() -> VRequest {
        VRequest::new(HttpRequest {
            method: Method::Get,
            uri: "/admin/panel".to_string(),
            version: HttpVersion::Http11,
            headers: Vec::new(),
            framing: crate::http::RequestBodyFraming::None,
            expect_continue: false,
            keep_alive: true,
        })
    }

    #[test]
    fn setting_action_records_key_value() {
        let mut vr = sample_vr();
        let action = Action::Setting {
            key: "root".to_string(),
            value: "/srv/www".to_string(),
        };
        action.run(&mut vr).unwrap();
        assert_eq!(vr.settings.get("root").map(String::as_str), Some("/srv/www"));
    }

    #[test]
    fn condition_picks_matching_branch() {
        let mut vr = sample_vr();
        let action = Action::Condition {
            cond: Condition::PathPrefix("/admin".to_string()),
            then_branch: vec![Action::Setting {
                key: "auth".to_string(),
                value: "required".to_string(),
            }],
            else_branch: vec![],
        };
        action.run(&mut vr).unwrap();
        assert_eq!(vr.settings.get("auth").map(String::as_str), Some("required"));
    }
}
