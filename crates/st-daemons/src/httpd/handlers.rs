//! Handler functions of the HTTP daemon.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use st_core::toolbox::Command;

use super::{HttpState, COMMAND_TIMEOUT_SEC, DURATION_STATS};

const CMD_FORM_PAGE: &str = r#"<html>
<head><title>steward</title></head>
<body>
<form action="cmd_form" method="post">
    <p><input type="password" name="cmd" size="80" /></p>
    <p><input type="submit" value="Exec" /></p>
    <pre>%s</pre>
</form>
</body>
</html>"#;

const MAIL_ME_PAGE: &str = r#"<html>
<head><title>mail me</title></head>
<body>
<form action="mail_me" method="post">
    <p><textarea name="msg" rows="6" cols="60"></textarea></p>
    <p><input type="submit" value="Send" /></p>
    <pre>%s</pre>
</form>
</body>
</html>"#;

/// Wrap text in a TwiML CDATA section, breaking the text's own terminators
/// apart so they cannot escape it.
pub(super) fn twiml_cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

fn twiml_response(inner: &str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>{inner}</Response>"),
    )
        .into_response()
}

#[derive(Deserialize)]
pub(super) struct CmdFormBody {
    #[serde(default)]
    cmd: String,
}

pub(super) async fn cmd_form_page(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(refusal) = state.gate(&state.cmd_form_limit, &headers, &addr) {
        return refusal;
    }
    Html(CMD_FORM_PAGE.replace("%s", "")).into_response()
}

pub(super) async fn cmd_form_execute(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(body): Form<CmdFormBody>,
) -> Response {
    if let Err(refusal) = state.gate(&state.cmd_form_limit, &headers, &addr) {
        return refusal;
    }
    let began = Instant::now();
    if body.cmd.is_empty() {
        return Html(CMD_FORM_PAGE.replace("%s", "")).into_response();
    }
    let result = state
        .processor
        .process(Command::new(body.cmd, COMMAND_TIMEOUT_SEC))
        .await;
    DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    Html(CMD_FORM_PAGE.replace("%s", &html_escape(&result.combined_output))).into_response()
}

#[derive(Deserialize)]
pub(super) struct TwilioSmsBody {
    #[serde(default, rename = "Body")]
    body: String,
    #[serde(default, rename = "From")]
    from: String,
}

/// Twilio SMS webhook: run the SMS text as a command and reply with TwiML.
pub(super) async fn twilio_sms_hook(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(sms): Form<TwilioSmsBody>,
) -> Response {
    if let Err(refusal) = state.gate(&state.twilio_limit, &headers, &addr) {
        return refusal;
    }
    // Spam prevention: one interaction per phone number per interval.
    if !sms.from.is_empty() && !state.phone_number_limit.add(&sms.from, true) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("rate limit is exceeded by {}", sms.from),
        )
            .into_response();
    }
    let began = Instant::now();
    let result = state
        .processor
        .process(Command::new(sms.body, COMMAND_TIMEOUT_SEC))
        .await;
    DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
    twiml_response(&format!(
        "<Message>{}</Message>",
        twiml_cdata(&result.combined_output)
    ))
}

#[derive(Deserialize)]
pub(super) struct TwilioCallBody {
    #[serde(default, rename = "From")]
    from: String,
}

/// Twilio voice webhook: greet the caller, or reject a spamming number.
pub(super) async fn twilio_call_greeting(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    call: Option<Form<TwilioCallBody>>,
) -> Response {
    if let Err(refusal) = state.gate(&state.twilio_limit, &headers, &addr) {
        return refusal;
    }
    let from = call.map(|Form(body)| body.from).unwrap_or_default();
    if !from.is_empty() && !state.phone_number_limit.add(&from, true) {
        return twiml_response("<Reject/>");
    }
    twiml_response(&format!(
        "<Say>{}</Say>",
        twiml_cdata(&state.twilio_call_greeting)
    ))
}

#[derive(Deserialize)]
pub(super) struct MailMeBody {
    #[serde(default)]
    msg: String,
}

pub(super) async fn mail_me_page(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(refusal) = state.gate(&state.mail_me_limit, &headers, &addr) {
        return refusal;
    }
    Html(MAIL_ME_PAGE.replace("%s", "")).into_response()
}

/// Relay the visitor's message to the configured recipients in the
/// background; the page reports submission, not delivery.
pub(super) async fn mail_me_submit(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(body): Form<MailMeBody>,
) -> Response {
    if let Err(refusal) = state.gate(&state.mail_me_limit, &headers, &addr) {
        return refusal;
    }
    if body.msg.trim().is_empty() {
        return Html(MAIL_ME_PAGE.replace("%s", "")).into_response();
    }
    if state.mail_me_recipients.is_empty() || !state.mail_client.is_configured() {
        return Html(MAIL_ME_PAGE.replace("%s", "the mail-me feature is not configured"))
            .into_response();
    }
    let client = state.mail_client.clone();
    let recipients = state.mail_me_recipients.clone();
    let client_ip = super::get_real_client_ip(&headers, &addr);
    let message = format!("{} says: {}", client_ip, body.msg);
    tokio::spawn(async move {
        if let Err(err) = client.send("mail-me", &message, &recipients).await {
            tracing::warn!(error = %format!("{err:#}"), "httpd: failed to deliver mail-me message");
        }
    });
    Html(MAIL_ME_PAGE.replace("%s", "message submitted")).into_response()
}

/// Resolve a request path inside the configured directory, refusing any
/// traversal outside it.
pub(super) fn resolve_directory_path(dir: &str, rest: &str) -> Option<PathBuf> {
    let mut resolved = PathBuf::from(dir);
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

/// Cheap static file serving on the configured URL prefixes.
pub(super) async fn serve_directory(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Err(refusal) = state.gate(&state.directory_limit, &headers, &addr) {
        return refusal;
    }
    let request_path = uri.path();
    // Longest matching configured prefix wins.
    let matched = state
        .serve_directories
        .iter()
        .filter(|(prefix, _)| {
            request_path == prefix.as_str()
                || request_path.starts_with(&format!("{prefix}/"))
        })
        .max_by_key(|(prefix, _)| prefix.len());
    let (prefix, dir) = match matched {
        Some(found) => found,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let rest = request_path[prefix.len()..].trim_start_matches('/');
    let target = match resolve_directory_path(dir, rest) {
        Some(target) => target,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => {
            let mut listing = String::from("<pre>\n");
            if let Ok(mut entries) = tokio::fs::read_dir(&target).await {
                let mut names = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                for name in names {
                    listing.push_str(&format!(
                        "<a href=\"{}\">{}</a>\n",
                        name,
                        html_escape(&name)
                    ));
                }
            }
            listing.push_str("</pre>\n");
            Html(listing).into_response()
        }
        Ok(_) => match tokio::fs::read(&target).await {
            Ok(content) => (StatusCode::OK, content).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdata_cannot_be_escaped() {
        assert_eq!(twiml_cdata("hello"), "<![CDATA[hello]]>");
        assert_eq!(
            twiml_cdata("bad ]]> break"),
            "<![CDATA[bad ]]]]><![CDATA[> break]]>"
        );
    }

    #[test]
    fn directory_paths_cannot_escape_the_root() {
        assert_eq!(
            resolve_directory_path("/srv/www", "a/b.html"),
            Some(PathBuf::from("/srv/www/a/b.html"))
        );
        assert_eq!(
            resolve_directory_path("/srv/www", "./a.html"),
            Some(PathBuf::from("/srv/www/a.html"))
        );
        assert!(resolve_directory_path("/srv/www", "../etc/passwd").is_none());
        assert!(resolve_directory_path("/srv/www", "a/../../etc").is_none());
        assert!(resolve_directory_path("/srv/www", "/etc/passwd").is_none());
    }

    #[test]
    fn html_escaping() {
        assert_eq!(html_escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
