//! End-to-end requests against the HTTP daemon's handler surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use st_config::HttpDaemonConfig;
use st_core::mail::MailClient;
use st_core::testsupport::get_test_command_processor;
use st_daemons::httpd::Daemon;

fn config(port: u16, serve_directories: HashMap<String, String>) -> HttpDaemonConfig {
    HttpDaemonConfig {
        address: "127.0.0.1".to_string(),
        port,
        base_rate_limit: 10,
        serve_directories,
        twilio_call_greeting: "Hi there".to_string(),
        mail_me_recipients: Vec::new(),
    }
}

async fn start(config: &HttpDaemonConfig) -> (Arc<Daemon>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let processor = Arc::new(get_test_command_processor());
    let daemon = Arc::new(Daemon::new(config, processor, MailClient::default()).unwrap());
    let serving = daemon.clone();
    let handle = tokio::spawn(async move { serving.start_and_block().await });
    sleep(Duration::from_millis(300)).await;
    (daemon, handle)
}

#[tokio::test]
async fn command_form_executes_commands() {
    let (daemon, handle) = start(&config(23717, HashMap::new())).await;
    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:23717";

    // The form page itself.
    let resp = client.get(format!("{base}/cmd_form")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("submit"));

    // Submitting a command; the PIN sits right against the trigger.
    let resp = client
        .post(format!("{base}/cmd_form"))
        .form(&[("cmd", "verysecret.sls /")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("bin"), "unexpected body: {body}");

    daemon.stop();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn twilio_sms_hook_speaks_twiml() {
    let (daemon, handle) = start(&config(23718, HashMap::new())).await;
    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:23718";

    // Bad PIN: the mismatch text travels inside TwiML.
    let resp = client
        .post(format!("{base}/sms_hook"))
        .form(&[("Body", "incorrect PIN")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(
        body.contains("<Message><![CDATA[Failed to match PIN/shortcut]]></Message>"),
        "unexpected body: {body}"
    );

    // The 35-character lint window truncates the output inside the CDATA.
    let resp = client
        .post(format!("{base}/sms_hook"))
        .form(&[(
            "Body",
            "verysecret .s echo 0123456789012345678901234567890123456789",
        )])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(
        body.contains("<![CDATA[01234567890123456789012345678901234]]>"),
        "unexpected body: {body}"
    );

    // A second interaction from one phone number within the window is
    // refused.
    let resp = client
        .post(format!("{base}/sms_hook"))
        .form(&[("Body", "verysecret .s echo hi"), ("From", "sms number")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{base}/sms_hook"))
        .form(&[("Body", "verysecret .s echo hi"), ("From", "sms number")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert!(resp
        .text()
        .await
        .unwrap()
        .contains("rate limit is exceeded by"));

    daemon.stop();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn twilio_call_greeting_and_spam_rejection() {
    let (daemon, handle) = start(&config(23719, HashMap::new())).await;
    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:23719";

    let resp = client
        .get(format!("{base}/call_greeting"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .text()
        .await
        .unwrap()
        .contains("<Say><![CDATA[Hi there]]></Say>"));

    // The first call from a number is greeted, the second rejected.
    let resp = client
        .post(format!("{base}/call_greeting"))
        .form(&[("From", "call number")])
        .send()
        .await
        .unwrap();
    assert!(resp.text().await.unwrap().contains("<Say>"));
    let resp = client
        .post(format!("{base}/call_greeting"))
        .form(&[("From", "call number")])
        .send()
        .await
        .unwrap();
    assert!(resp
        .text()
        .await
        .unwrap()
        .contains("<Response><Reject/></Response>"));

    daemon.stop();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn directory_serving() {
    let dir = std::env::temp_dir().join("steward-httpd-test-dir");
    let _ = std::fs::create_dir_all(&dir);
    std::fs::write(dir.join("a.html"), "a html").unwrap();

    let mut directories = HashMap::new();
    directories.insert("/my/dir".to_string(), dir.to_string_lossy().into_owned());
    let (daemon, handle) = start(&config(23720, directories)).await;
    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:23720";

    let resp = client
        .get(format!("{base}/my/dir/a.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "a html");

    // The directory listing links its entries.
    let resp = client.get(format!("{base}/my/dir")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("a.html"));

    // Missing files and traversal attempts are 404.
    let resp = client
        .get(format!("{base}/my/dir/doesnotexist.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    daemon.stop();
    let _ = handle.await.unwrap();
}
