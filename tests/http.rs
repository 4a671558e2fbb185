#![cfg(feature = "web")]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use chrono::{Datelike, Local};
use releves_ste::app::{AppState, router};
use releves_ste::config::Config;
use releves_ste::entry::DRAFT_MESSAGE;
use releves_ste::store::Status;
use releves_ste::Site;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    state: Arc<AppState>,
    app: Router,
}

fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let state = Arc::new(AppState::new(Config::with_data_dir(dir.path())).unwrap());
    state.store.initialize().unwrap();
    let app = router(state.clone());
    TestApp { _dir: dir, state, app }
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn location(response: &Response) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

fn form(uri: &str, body: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

/// Logs in with `code` and returns the `session=...` cookie pair.
async fn login(app: &Router, code: &str) -> String {
    let response = send(app, form("/login", &format!("code={}", code), None)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn pages_redirect_to_login_without_session() {
    let t = test_app();
    let response = send(&t.app, get("/", None)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");

    let response = send(&t.app, get("/login", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_code_shows_an_error() {
    let t = test_app();
    let response = send(&t.app, form("/login", "code=99", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert!(body_text(response).await.contains("incorrect"));
}

#[tokio::test]
async fn roles_gate_route_groups() {
    let t = test_app();
    let operator = login(&t.app, "12").await;
    let manager = login(&t.app, "14").await;

    let response = send(&t.app, get("/", Some(&operator))).await;
    assert_eq!(response.status(), StatusCode::OK);

    for uri in ["/releve_20", "/rapports", "/gestion_excel"] {
        let response = send(&t.app, get(uri, Some(&operator))).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", uri);
    }
    for uri in ["/releve_20", "/rapports", "/gestion_excel"] {
        let response = send(&t.app, get(uri, Some(&manager))).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }
}

#[tokio::test]
async fn logout_ends_the_session() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;
    let response = send(&t.app, get("/logout", Some(&cookie))).await;
    assert_eq!(location(&response), "/login");

    let response = send(&t.app, get("/", Some(&cookie))).await;
    assert_eq!(location(&response), "/login");
}

#[tokio::test]
async fn entry_form_saves_a_draft() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;

    let response = send(&t.app, get("/saisie/LPZ", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("Exhaure 1"));

    let response = send(&t.app, form("/saisie/LPZ", "Exhaure+1=1500&CO2=", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains(DRAFT_MESSAGE));

    let sheet = t.state.store.load(Site::Lpz).unwrap();
    let today = Local::now().date_naive();
    let (_, draft) = sheet.rows_on(today, Status::Draft).next().unwrap();
    assert_eq!(draft.value("Exhaure 1"), "1500");
    assert_eq!(draft.value("CO2"), "");
}

#[tokio::test]
async fn validated_day_shows_the_alert() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;
    send(&t.app, form("/saisie/SMP", "Forage=3&finaliser=1", Some(&cookie))).await;

    let response = send(&t.app, get("/saisie/SMP", Some(&cookie))).await;
    assert!(body_text(response).await.contains("choix"));

    let response = send(&t.app, form("/saisie/SMP", "choix=annuler", Some(&cookie))).await;
    assert_eq!(location(&response), "/");

    let response = send(&t.app, form("/saisie/SMP", "choix=modifier", Some(&cookie))).await;
    assert_eq!(location(&response), "/saisie/SMP");
    let sheet = t.state.store.load(Site::Smp).unwrap();
    let today = Local::now().date_naive();
    assert_eq!(sheet.rows_on(today, Status::Draft).count(), 1);
    assert_eq!(sheet.rows_on(today, Status::Validated).count(), 0);
}

#[tokio::test]
async fn unknown_site_is_not_found() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;
    let response = send(&t.app, get("/saisie/ABC", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn visualisation_rejects_parameters_of_another_site() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;
    let response = send(
        &t.app,
        form("/visualisation", "site=LPZ&parametre=Forage&semaine=&annee=", Some(&cookie)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("Paramètre inconnu pour LPZ"));
}

#[tokio::test]
async fn chart_files_are_served_from_the_cache() {
    let t = test_app();
    let cookie = login(&t.app, "12").await;
    let key = t
        .state
        .cache
        .key(Site::Smp, "Forage", None, None, releves_ste::cache::ReportKind::Visualisation);
    t.state.cache.put(&key, b"png").unwrap();

    let response = send(&t.app, get(&format!("/graphique/{}", key.file_name()), Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

    let response = send(&t.app, get("/graphique/absent.png", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn report_deletion_returns_to_the_form() {
    let t = test_app();
    let cookie = login(&t.app, "14").await;
    t.state.reports.record(Site::Lpz, 4, 2025).unwrap();

    let response = send(&t.app, get("/rapports", Some(&cookie))).await;
    assert!(body_text(response).await.contains("LPZ"));

    let response = send(&t.app, get("/supprimer_rapport?site=LPZ&semaine=4&annee=2025", Some(&cookie))).await;
    assert_eq!(location(&response), "/rapport?site=LPZ");
    assert!(t.state.reports.list().unwrap().is_empty());
}

#[tokio::test]
async fn photo_upload_is_logged_and_served() {
    let t = test_app();
    let cookie = login(&t.app, "13").await;

    let boundary = "XBOUNDARYX";
    let mut body = String::new();
    for (name, value) in [("site", "LPZ"), ("mois", "3"), ("annee", "2025")] {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{n}\"\r\n\r\n{v}\r\n",
            b = boundary,
            n = name,
            v = value
        ));
    }
    body.push_str(&format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"photo_Exhaure_1\"; filename=\"a.jpg\"\r\n\
         Content-Type: image/jpeg\r\n\r\njpegdata\r\n--{b}--\r\n",
        b = boundary
    ));
    let request = Request::post("/releve_20")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
        .header(header::COOKIE, &cookie)
        .body(Body::from(body))
        .unwrap();
    let response = send(&t.app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let set = t.state.photos.find(Site::Lpz, 3, 2025).unwrap().unwrap();
    let path = &set.photos["Exhaure 1"];
    let response = send(&t.app, get(&format!("/photos_releves/{}", path), Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"jpegdata");

    let operator = login(&t.app, "12").await;
    let response = send(&t.app, get(&format!("/photos_releves/{}", path), Some(&operator))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn editor_reports_bad_dates() {
    let t = test_app();
    let cookie = login(&t.app, "14").await;
    let entry = login(&t.app, "12").await;
    send(&t.app, form("/saisie/SMP", "Forage=3", Some(&entry))).await;

    let response = send(&t.app, form("/gestion_excel?site=SMP", "cell_0_Date=demain", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("date invalide"));

    let response = send(&t.app, form("/gestion_excel?site=SMP", "cell_0_Forage=4", Some(&cookie))).await;
    assert!(body_text(response).await.contains("Modifications enregistrées"));
    assert_eq!(t.state.store.load(Site::Smp).unwrap().rows[0].value("Forage"), "4");
}

#[tokio::test]
async fn csv_export_is_an_attachment() {
    let t = test_app();
    let cookie = login(&t.app, "14").await;
    let response = send(&t.app, get("/export_csv?site=LPZ", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"mesures_LPZ.csv\""
    );
    assert!(body_text(response).await.starts_with("Date,Statut,"));
}

#[tokio::test]
async fn generated_report_is_logged_cached_and_exported() {
    let t = test_app();
    let entry = login(&t.app, "12").await;
    send(&t.app, form("/saisie/LPZ", "pH+entr%C3%A9e=7,2&finaliser=1", Some(&entry))).await;
    let today = Local::now().date_naive();
    let (week, year) = (today.iso_week().week(), today.year());

    let cookie = login(&t.app, "14").await;
    let response = send(
        &t.app,
        form("/rapport", &format!("site=LPZ&semaine={}&annee={}", week, year), Some(&cookie)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let logged = t.state.reports.list().unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!((logged[0].site, logged[0].week, logged[0].year), (Site::Lpz, week, year));

    let expected = Site::Lpz
        .measurements()
        .iter()
        .filter(|p| Site::Lpz.report_shape(p).is_some())
        .count();
    let cached = std::fs::read_dir(t.state.cache.dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("LPZ_"))
        .count();
    assert_eq!(cached, expected);

    let response = send(
        &t.app,
        get(&format!("/rapport/pdf?site=LPZ&semaine={}&annee={}", week, year), Some(&cookie)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.starts_with(b"%PDF"));
}
