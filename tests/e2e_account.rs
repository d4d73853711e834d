//! E2E tests for account, profile picture and discovery endpoints

mod common;

use common::{IG_USER_ID, TestServer};
use creatorsync::data::Owner;
use serde_json::{Value, json};
use std::time::Duration;

const DISCOVERY_PATH: &str = "/v21.0/17841400000000001";

#[tokio::test]
async fn test_get_account_hides_token() {
    let server = TestServer::new().await;
    let account = server
        .create_account(Owner::Company("c1".to_string()), IG_USER_ID)
        .await;

    let response = server
        .client
        .get(server.url("/account?owner=company"))
        .bearer_auth(server.session_token("u1", Some("c1")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], account.id.as_str());
    assert_eq!(body["ig_user_id"], IG_USER_ID);
    assert_eq!(body["token_state"], "long_lived");
    assert_eq!(body["sync_in_progress"], false);
    assert!(body.get("access_token").is_none());
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::Company("c1".to_string()), IG_USER_ID)
        .await;

    // The same user acting for themselves sees no account.
    let response = server
        .client
        .get(server.url("/account"))
        .bearer_auth(server.session_token("u1", Some("c1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = server
        .client
        .get(server.url("/account?owner=company"))
        .bearer_auth(server.session_token("u1", Some("c2")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_disconnect_keeps_history_readable() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    let token = server.session_token("u1", None);

    let response = server
        .client
        .delete(server.url("/account"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let body: Value = server
        .client
        .get(server.url("/account"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["is_active"], false);
    assert_eq!(body["token_state"], "no_token");

    let response = server
        .client
        .get(server.url("/conversations"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url("/discovery/brand"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_profile_picture_miss_is_fetched_in_background() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    server.accept_tokens();
    server.graph.route(
        DISCOVERY_PATH,
        200,
        json!({"business_discovery": {"username": "brand", "profile_picture_url": "https://cdn.example/brand.jpg"}}),
    );
    let token = server.session_token("u1", None);
    let url = server.url("/profile-pictures/@Brand");

    let first: Value = server
        .client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["username"], "brand");
    assert!(first["profile_picture_url"].is_null());

    let mut resolved = Value::Null;
    for _ in 0..100 {
        let body: Value = server
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if !body["profile_picture_url"].is_null() {
            resolved = body["profile_picture_url"].clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(resolved, "https://cdn.example/brand.jpg");
}

#[tokio::test]
async fn test_profile_picture_miss_does_not_borrow_another_owners_token() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    server.accept_tokens();
    server.graph.route(
        DISCOVERY_PATH,
        200,
        json!({"business_discovery": {"username": "brand", "profile_picture_url": "https://cdn.example/brand.jpg"}}),
    );
    let token = server.session_token("u2", None);

    let body: Value = server
        .client
        .get(server.url("/profile-pictures/brand"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["profile_picture_url"].is_null());

    server.state.tasks.shutdown(Duration::from_secs(5)).await;
    assert!(
        !server
            .graph
            .urls()
            .iter()
            .any(|u| u.ends_with(DISCOVERY_PATH))
    );
}

#[tokio::test]
async fn test_profile_picture_batch() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    let token = server.session_token("u1", None);

    let response = server
        .client
        .post(server.url("/profile-pictures"))
        .bearer_auth(&token)
        .json(&json!({"usernames": ["creator", "@Creator", "not a handle", "fan"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let pictures = body["profile_pictures"].as_object().unwrap();
    assert_eq!(pictures.len(), 2);
    assert!(pictures["creator"].is_null());
    assert!(pictures["fan"].is_null());

    let usernames: Vec<String> = (0..101).map(|i| format!("user{}", i)).collect();
    let response = server
        .client
        .post(server.url("/profile-pictures"))
        .bearer_auth(&token)
        .json(&json!({ "usernames": usernames }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_discovery_counts_against_quota() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    server.accept_tokens();
    server.graph.route(
        DISCOVERY_PATH,
        200,
        json!({"business_discovery": {"username": "brand", "name": "Brand Co", "followers_count": 5000}}),
    );
    let token = server.session_token("u1", None);

    for _ in 0..2 {
        let response = server
            .client
            .get(server.url("/discovery/brand"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["followers_count"], 5000);
    }

    let response = server
        .client
        .get(server.url("/discovery/brand"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);

    let usage: Value = server
        .client
        .get(server.url("/quota"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["used"], 2);
    assert_eq!(usage["remaining"], 0);
    assert!(!usage["resets_at"].is_null());
}

#[tokio::test]
async fn test_failed_discovery_is_not_counted() {
    let server = TestServer::new().await;
    server
        .create_account(Owner::User("u1".to_string()), IG_USER_ID)
        .await;
    server.accept_tokens();
    server.graph.route(
        DISCOVERY_PATH,
        400,
        json!({"error": {"message": "Invalid user id", "type": "IGApiException", "code": 110}}),
    );
    let token = server.session_token("u1", None);

    let response = server
        .client
        .get(server.url("/discovery/nobody"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let usage = server
        .state
        .quota
        .usage(&Owner::User("u1".to_string()))
        .await
        .unwrap();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.remaining, 2);
}
