//! A mock Qualer tenant on top of wiremock
//!
//! The tenant serves a login form with an anti-forgery token, accepts one account, and
//! answers the JSON endpoints only for requests carrying its session cookie. Anything
//! else is redirected to the login page, the way the real site behaves.

use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

pub const USERNAME: &str = "metrologist@example.com";
pub const PASSWORD: &str = "hunter2";
pub const TOKEN: &str = "tok-8c1f";
pub const SESSION_COOKIE: &str = "Qualer.Employee.Login.SessionId";
pub const SESSION_VALUE: &str = "abc123";

/// Matches requests that carry the tenant's session cookie
pub struct HasSession;

impl Match for HasSession {
    fn matches(&self, request: &Request) -> bool {
        request
            .headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(&format!("{}={}", SESSION_COOKIE, SESSION_VALUE)))
    }
}

fn login_page() -> String {
    format!(
        r#"<html><body><form method="post" action="/login">
<input name="__RequestVerificationToken" type="hidden" value="{}" />
<input name="Email" type="text" /><input name="Password" type="password" />
</form></body></html>"#,
        TOKEN
    )
}

fn to_login() -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", "/login?ReturnUrl=%2F")
}

/// Start a tenant with the login flow mounted and no data endpoints
pub async fn start_tenant() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(login_page()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_string_contains(format!("Password={}", PASSWORD)))
        .and(body_string_contains(format!(
            "__RequestVerificationToken={}",
            TOKEN
        )))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/Dashboard")
                .insert_header(
                    "Set-Cookie",
                    format!("{}={}; Path=/", SESSION_COOKIE, SESSION_VALUE).as_str(),
                ),
        )
        .with_priority(1)
        .mount(&server)
        .await;

    // Wrong credentials re-render the login page
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(login_page()))
        .with_priority(10)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Dashboard"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>Dashboard</html>"))
        .mount(&server)
        .await;

    server
}

/// Serve `body` at `route` for authenticated requests, redirect everyone else to login
pub async fn serve_json(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(HasSession)
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(3)
        .mount(server)
        .await;
    redirect_anonymous(server, route).await;
}

/// Serve one uncertainty budget lookup
pub async fn serve_budgets(server: &MockServer, service_group: i64, technique: i64, body: &str) {
    Mock::given(method("GET"))
        .and(path("/ServiceGroupTechnique/UncertaintyBudgets"))
        .and(query_param("serviceGroupId", service_group.to_string()))
        .and(query_param("techniqueId", technique.to_string()))
        .and(HasSession)
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(3)
        .mount(server)
        .await;
    redirect_anonymous(server, "/ServiceGroupTechnique/UncertaintyBudgets").await;
}

/// Serve one capabilities lookup
pub async fn serve_capabilities(server: &MockServer, technique: i64, certification: i64, body: &str) {
    Mock::given(method("GET"))
        .and(path("/CertificationCapability/Capabilities_Read"))
        .and(query_param("techniqueId", technique.to_string()))
        .and(query_param("certificationId", certification.to_string()))
        .and(HasSession)
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(3)
        .mount(server)
        .await;
    redirect_anonymous(server, "/CertificationCapability/Capabilities_Read").await;
}

/// Serve the uncertainty components of one budget
pub async fn serve_components(server: &MockServer, budget: i64, body: &str) {
    Mock::given(method("GET"))
        .and(path("/UncertaintyComponent/List"))
        .and(query_param("UncertaintyBudgetId", budget.to_string()))
        .and(HasSession)
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(3)
        .mount(server)
        .await;
    redirect_anonymous(server, "/UncertaintyComponent/List").await;
}

/// Mount the two reference lists; the techniques list comes wrapped in `<pre>`
pub async fn serve_reference_lists(server: &MockServer) {
    serve_json(
        server,
        "/ServiceType/ServiceCapabilities",
        r#"{"views": [{"ServiceGroupId": 1, "Name": "Dimensional"}, {"ServiceGroupId": 2, "Name": "Mass"}]}"#,
    )
    .await;
    serve_json(
        server,
        "/ServiceGroupTechnique/TechniquesList",
        "<html><body><pre>[{&quot;TechniqueId&quot;: 10, &quot;Name&quot;: &quot;Gauge blocks &amp; rings&quot;}]</pre></body></html>",
    )
    .await;
}

/// Expire the session once: the next request to `route` lands on the login page
pub async fn expire_once(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(to_login())
        .with_priority(1)
        .up_to_n_times(1)
        .mount(server)
        .await;
}

async fn redirect_anonymous(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(to_login())
        .with_priority(9)
        .mount(server)
        .await;
}

/// Number of login form submissions the tenant received
pub async fn login_posts(server: &MockServer) -> usize {
    requests_to(server, "POST", "/login").await
}

/// Number of requests with `method` to `route`
pub async fn requests_to(server: &MockServer, method: &str, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == route)
        .count()
}
