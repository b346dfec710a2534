use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use mural::backend::LocalBackend;
use mural::config::Config;
use mural::state::AppState;
use mural::{db, routes};
use rusqlite::params;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "mural-test-boundary";

/// Lowest cost bcrypt accepts.
const TEST_HASH_COST: u32 = 4;

struct TestApp {
    _tmp: TempDir,
    app: Router,
    backend: LocalBackend,
}

fn test_app() -> TestApp {
    let tmp = TempDir::new().unwrap();
    let pool = db::create_pool(&tmp.path().join("test.db")).expect("Failed to create test database");
    db::run_migrations(&pool).expect("Failed to run migrations");

    let backend = LocalBackend::new(pool, tmp.path().join("media"), 1)
        .with_hash_cost(TEST_HASH_COST);
    let state = AppState::local(backend.clone(), Config::default());

    TestApp {
        _tmp: tmp,
        app: routes::build_router(state),
        backend,
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, file_name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut builder = Request::get(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn post_form(&self, uri: &str, form: &str, cookie: Option<&str>) -> Response<Body> {
        let mut builder = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::from(form.to_string())).unwrap())
            .await
    }

    async fn post_multipart(&self, uri: &str, parts: &[Part<'_>], cookie: &str) -> Response<Body> {
        let request = Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .header(header::COOKIE, cookie)
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        self.send(request).await
    }

    async fn register(&self, handle: &str, email: &str) {
        let form = format!(
            "handle={}&email={}&password=secret1",
            handle,
            email.replace('@', "%40")
        );
        let response = self.post_form("/register", &form, None).await;
        let body = body_text(response).await;
        assert!(body.contains("Account created"), "registration failed: {}", body);
    }

    /// Sign in and return a `Cookie` header with every cookie set.
    async fn login(&self, identifier: &str) -> String {
        let form = format!("identifier={}&password=secret1", identifier.replace('@', "%40"));
        let response = self.post_form("/login", &form, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/feed");

        let cookie = cookie_header(&response);
        assert!(!cookie.is_empty(), "login sets a cookie");
        cookie
    }

    fn user_id(&self, handle: &str) -> String {
        let conn = self.backend.db().get().unwrap();
        conn.query_row(
            "SELECT id_usuario FROM usuarios WHERE usuario = ?1",
            params![handle],
            |r| r.get(0),
        )
        .unwrap()
    }
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `name=value` pairs of every `Set-Cookie`, joined as a `Cookie` header.
fn cookie_header(response: &Response<Body>) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

fn location(response: &Response<Body>) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// The pending avatar carried by the edit form's hidden field.
fn hidden_avatar_url(body: &str) -> String {
    let marker = "name=\"avatar_url\" value=\"";
    let start = body.find(marker).expect("hidden avatar field") + marker.len();
    let end = body[start..].find('"').unwrap() + start;
    body[start..end].replace("&#x2f;", "/")
}

#[tokio::test]
async fn root_redirects_by_session() {
    let app = test_app();

    let response = app.get("/", None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");

    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;
    let response = app.get("/", Some(&cookie)).await;
    assert_eq!(location(&response), "/feed");
}

#[tokio::test]
async fn protected_pages_redirect_without_session() {
    let app = test_app();

    for uri in ["/feed", "/profile", "/profile/edit"] {
        let response = app.get(uri, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", uri);
        assert_eq!(location(&response), "/login", "{}", uri);

        let response = app.get(uri, Some("mural_session=bogus")).await;
        assert_eq!(location(&response), "/login", "{} with stale cookie", uri);
    }
}

#[tokio::test]
async fn register_login_by_handle_and_see_empty_feed() {
    let app = test_app();

    let response = app
        .post_form(
            "/register",
            "handle=alice1&email=alice%40example.com&password=secret1",
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("Account created. Redirecting…"));
    assert!(body.contains("http-equiv=\"refresh\" content=\"1.5;url=/login\""));

    let response = app
        .post_form("/login", "identifier=alice1&password=secret1", None)
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("mural_session="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));

    let cookie = set_cookie.split(';').next().unwrap();
    let response = app.get("/feed", Some(cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("No posts yet"));
}

#[tokio::test]
async fn registration_errors_are_shown_in_the_form() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;

    let cases = [
        ("handle=&email=a%40b.c&password=secret1", "All fields are required."),
        ("handle=al&email=a%40b.c&password=secret1", "5 to 20 letters or numbers"),
        ("handle=bobby1&email=bobby&password=secret1", "Invalid email address."),
        ("handle=bobby1&email=b%40b.c&password=123", "at least 6 characters"),
        ("handle=alice1&email=x%40b.c&password=secret1", "That handle is already in use."),
        ("handle=alice2&email=alice%40example.com&password=secret1", "Could not create the account."),
    ];
    for (form, message) in cases {
        let body = body_text(app.post_form("/register", form, None).await).await;
        assert!(body.contains(message), "{} should mention {:?}", form, message);
        assert!(!body.contains("http-equiv=\"refresh\""));
    }
}

#[tokio::test]
async fn login_failures_share_one_message() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;

    for form in [
        "identifier=alice1&password=wrongpass",
        "identifier=nobody1&password=secret1",
        "identifier=nobody%40example.com&password=secret1",
    ] {
        let response = app.post_form("/login", form, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert!(body_text(response).await.contains("Incorrect user or password."));
    }

    let body = body_text(app.post_form("/login", "identifier=&password=", None).await).await;
    assert!(body.contains("All fields are required."));
}

#[tokio::test]
async fn logout_revokes_the_session() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice@example.com").await;

    let response = app.post_form("/logout", "", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");
    let cleared: Vec<&str> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cleared.len(), 2);
    assert!(cleared[0].starts_with("mural_session=;"));
    assert!(cleared[1].starts_with("mural_session_refresh=;"));
    assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));

    // Neither the access token nor its refresh token opens a page now
    let response = app.get("/feed", Some(&cookie)).await;
    assert_eq!(location(&response), "/login");
}

#[tokio::test]
async fn expired_access_token_is_renewed_from_refresh_cookie() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;
    assert!(cookie.contains("mural_session_refresh="));

    {
        let conn = app.backend.db().get().unwrap();
        conn.execute(
            "UPDATE sessions SET expires_at = datetime('now', '-1 hour')",
            [],
        )
        .unwrap();
    }

    let response = app.get("/feed", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let renewed = cookie_header(&response);
    assert!(renewed.starts_with("mural_session="));
    assert!(renewed.contains("; mural_session_refresh="));
    assert!(body_text(response).await.contains("No posts yet"));

    // The renewed pair works; the old refresh token was spent
    let response = app.get("/profile", Some(&renewed)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.get("/feed", Some(&cookie)).await;
    assert_eq!(location(&response), "/login");
}

#[tokio::test]
async fn feed_lists_posts_newest_first_with_likes() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    app.register("bobby1", "bob@example.com").await;
    let alice = app.user_id("alice1");
    let bob = app.user_id("bobby1");

    {
        let conn = app.backend.db().get().unwrap();
        conn.execute(
            "INSERT INTO publicaciones (id_publicacion, id_usuario, titulo, imagen_url, fecha_publicacion) \
             VALUES ('p-old', ?1, 'Older shot', '/img/old.jpg', '2024-01-10T08:00:00Z'), \
                    ('p-new', ?2, 'Newer shot', '/img/new.jpg', '2024-06-01T08:00:00Z')",
            params![alice, bob],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO likes (id_like, id_publicacion, id_usuario) \
             VALUES ('l1', 'p-new', ?1), ('l2', 'p-new', ?2)",
            params![alice, bob],
        )
        .unwrap();
    }

    let cookie = app.login("alice1").await;
    let body = body_text(app.get("/feed", Some(&cookie)).await).await;

    let newer = body.find("Newer shot").expect("newer post rendered");
    let older = body.find("Older shot").expect("older post rendered");
    assert!(newer < older, "feed should be newest first");
    assert!(body.contains("Jun 1, 2024"));
    assert!(body.contains("&#9829; 2"));
    assert!(body.contains("&#9829; 0"));
    assert!(!body.contains("No posts yet"));
}

#[tokio::test]
async fn profile_shows_counts_and_gallery() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;

    let body = body_text(app.get("/profile", Some(&cookie)).await).await;
    assert!(body.contains("alice1"));
    assert!(body.contains("0 posts"));
    assert!(body.contains("avatar-initial\">A<"));

    {
        let alice = app.user_id("alice1");
        let conn = app.backend.db().get().unwrap();
        conn.execute(
            "INSERT INTO publicaciones (id_publicacion, id_usuario, imagen_url) VALUES ('p1', ?1, '/img/1.jpg')",
            params![alice],
        )
        .unwrap();
    }

    let body = body_text(app.get("/profile", Some(&cookie)).await).await;
    assert!(body.contains("1 post<"));
    assert!(body.contains("id=\"post-p1\""));
}

#[tokio::test]
async fn profile_save_validates_and_persists() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    app.register("bobby1", "bob@example.com").await;
    let cookie = app.login("bobby1").await;

    let edit = body_text(app.get("/profile/edit", Some(&cookie)).await).await;
    assert!(edit.contains("value=\"bobby1\""));

    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[Part::Text("handle", "alice1"), Part::Text("bio", ""), Part::Text("avatar_url", "")],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("That handle is already in use."));

    let long_bio = "b".repeat(201);
    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[Part::Text("handle", "bobby2"), Part::Text("bio", &long_bio)],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Bio must be 200 characters or fewer."));

    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[Part::Text("handle", "  bobby2 "), Part::Text("bio", "hello there"), Part::Text("avatar_url", "")],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Changes saved"));
    assert!(body.contains("http-equiv=\"refresh\" content=\"2;url=/profile\""));

    let profile = body_text(app.get("/profile", Some(&cookie)).await).await;
    assert!(profile.contains("bobby2"));
    assert!(profile.contains("hello there"));
}

#[tokio::test]
async fn avatar_upload_is_pending_until_save() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;
    let alice = app.user_id("alice1");

    let body = body_text(
        app.post_multipart(
            "/profile/edit/avatar",
            &[
                Part::Text("handle", "alice1"),
                Part::File {
                    name: "avatar",
                    file_name: "notes.txt",
                    content_type: "text/plain",
                    data: b"not an image",
                },
            ],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Only images are allowed."));
    assert_eq!(hidden_avatar_url(&body), "");

    let body = body_text(
        app.post_multipart(
            "/profile/edit/avatar",
            &[
                Part::Text("handle", "alice1"),
                Part::Text("bio", ""),
                Part::Text("avatar_url", ""),
                Part::File {
                    name: "avatar",
                    file_name: "me.png",
                    content_type: "image/png",
                    data: b"\x89PNG\r\n\x1a\n",
                },
            ],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Photo uploaded"));
    let pending = hidden_avatar_url(&body);
    assert!(pending.starts_with(&format!("/media/imagenes_perfil/{}/", alice)));
    assert!(pending.ends_with("-me.png"));

    // Not on the profile yet
    let stored: Option<String> = {
        let conn = app.backend.db().get().unwrap();
        conn.query_row(
            "SELECT foto_perfil FROM usuarios WHERE id_usuario = ?1",
            params![alice],
            |r| r.get(0),
        )
        .unwrap()
    };
    assert!(stored.is_none());

    let blob = app.get(&pending, None).await;
    assert_eq!(blob.status(), StatusCode::OK);
    assert_eq!(blob.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");

    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[
                Part::Text("handle", "alice1"),
                Part::Text("bio", ""),
                Part::Text("avatar_url", &pending),
            ],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Changes saved"));

    let stored: Option<String> = {
        let conn = app.backend.db().get().unwrap();
        conn.query_row(
            "SELECT foto_perfil FROM usuarios WHERE id_usuario = ?1",
            params![alice],
            |r| r.get(0),
        )
        .unwrap()
    };
    assert_eq!(stored.as_deref(), Some(pending.as_str()));
}

#[tokio::test]
async fn save_rejects_avatar_outside_own_namespace() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;

    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[
                Part::Text("handle", "alice1"),
                Part::Text("avatar_url", "/media/imagenes_perfil/someone/1-x.png"),
            ],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("That photo does not belong to this account."));

    // Starts with the caller's prefix but climbs into another user's folder
    app.register("bobby1", "bob@example.com").await;
    let alice = app.user_id("alice1");
    let bob = app.user_id("bobby1");
    for url in [
        format!("/media/imagenes_perfil/{}/../{}/1-bob.png", alice, bob),
        format!("/media/imagenes_perfil/{}/..%2f{}%2f1-bob.png", alice, bob),
    ] {
        let body = body_text(
            app.post_multipart(
                "/profile/edit",
                &[Part::Text("handle", "alice1"), Part::Text("avatar_url", &url)],
                &cookie,
            )
            .await,
        )
        .await;
        assert!(
            body.contains("That photo does not belong to this account."),
            "accepted {}",
            url
        );
    }

    let stored: Option<String> = {
        let conn = app.backend.db().get().unwrap();
        conn.query_row(
            "SELECT foto_perfil FROM usuarios WHERE id_usuario = ?1",
            params![alice],
            |r| r.get(0),
        )
        .unwrap()
    };
    assert!(stored.is_none());
}

#[tokio::test]
async fn invalid_save_does_not_store_the_chosen_file() {
    let app = test_app();
    app.register("alice1", "alice@example.com").await;
    let cookie = app.login("alice1").await;

    let body = body_text(
        app.post_multipart(
            "/profile/edit",
            &[
                Part::Text("handle", "al"),
                Part::Text("bio", ""),
                Part::Text("avatar_url", ""),
                Part::File {
                    name: "avatar",
                    file_name: "me.png",
                    content_type: "image/png",
                    data: b"\x89PNG\r\n\x1a\n",
                },
            ],
            &cookie,
        )
        .await,
    )
    .await;
    assert!(body.contains("Handle must be at least 3 characters."));
    assert_eq!(hidden_avatar_url(&body), "");
    assert!(!app
        .backend
        .media_root()
        .join("imagenes_perfil")
        .exists());
}

#[tokio::test]
async fn media_route_rejects_traversal_and_missing_files() {
    let app = test_app();

    let response = app.get("/media/imagenes_perfil/nobody/1-x.png", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.get("/media/../test.db", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
