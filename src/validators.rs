use crate::{
    ApplicationConfig, ConfigState, RejectionReason, RequestContext, ServiceConfig, UserConfig,
};

/// The configured entity a call is made on behalf of.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject<'a> {
    Service,
    Application(&'a ApplicationConfig),
    User(&'a UserConfig),
}

impl Subject<'_> {
    fn state(&self) -> ConfigState {
        match self {
            Subject::Service => ConfigState::Active,
            Subject::Application(application) => application.state,
            Subject::User(user) => user.state,
        }
    }
}

/// First state failure for the call, checked in rejection priority order.
pub(crate) fn validate(
    service: &ServiceConfig,
    subject: Subject<'_>,
    context: &RequestContext,
) -> Option<RejectionReason> {
    if service.state != ConfigState::Active || subject.state() != ConfigState::Active {
        return Some(RejectionReason::Inactive);
    }

    if !credential_valid(service, subject, context.credential.as_deref()) {
        return Some(RejectionReason::InvalidCredential);
    }

    if !referrer_allowed(service, subject, context.referrer.as_deref()) {
        return Some(RejectionReason::ReferrerNotAllowed);
    }

    None
}

fn credential_valid(service: &ServiceConfig, subject: Subject<'_>, credential: Option<&str>) -> bool {
    let accepted = match subject {
        Subject::Service => &service.tokens,
        Subject::Application(application) => &application.keys,
        Subject::User(_) => return true,
    };

    if accepted.is_empty() {
        return true;
    }

    credential.is_some_and(|credential| accepted.iter().any(|k| k == credential))
}

fn referrer_allowed(service: &ServiceConfig, subject: Subject<'_>, referrer: Option<&str>) -> bool {
    let Subject::Application(application) = subject else {
        return true;
    };

    if !service.referrer_filters_required || application.referrer_filters.is_empty() {
        return true;
    }

    let Some(referrer) = referrer else {
        return false;
    };

    application
        .referrer_filters
        .iter()
        .any(|filter| wildcard_match(filter.as_bytes(), referrer.as_bytes()))
}

/// ASCII case-insensitive match where `*` stands for any run of characters.
pub(crate) fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if p < pattern.len() && pattern[p].eq_ignore_ascii_case(&text[t]) {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }

    p == pattern.len()
}
