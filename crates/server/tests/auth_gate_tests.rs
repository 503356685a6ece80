//! Integration tests for the code host check on the external endpoint.

mod common;

use axum::http::StatusCode;
use common::fixtures::{COMMIT, REPO, single_query};
use common::{TestServer, created_id};
use httpmock::prelude::*;
use indexgate_core::config::AuthConfig;
use indexgate_server::authz::AuthGate;
use indexgate_server::git::AcceptAllResolver;
use serde_json::json;
use std::sync::Arc;

async fn enforced_server(github: &MockServer) -> TestServer {
    let mut auth = AuthConfig {
        enforce: true,
        ..AuthConfig::default()
    };
    auth.github.api_url = github.base_url();
    let gate = AuthGate::from_config(&auth).unwrap();
    TestServer::with_options(
        move |config| config.auth = auth,
        gate,
        Arc::new(AcceptAllResolver),
    )
    .await
}

async fn mock_read_only(github: &MockServer) -> httpmock::Mock<'_> {
    github
        .mock_async(|when, then| {
            when.method(GET).path("/installation/repositories");
            then.status(401);
        })
        .await;
    github
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(200).json_body(json!({
                "data": { "repository": { "viewerPermission": "READ" } }
            }));
        })
        .await
}

#[tokio::test]
async fn test_site_admin_skips_code_host() {
    let github = MockServer::start_async().await;
    let graphql = mock_read_only(&github).await;
    let server = enforced_server(&github).await;
    let token = server.create_token(&["site-admin"]).await;

    let id = created_id(
        &server
            .upload(Some(&token), &single_query(REPO), b"admin".to_vec())
            .await,
    );
    assert!(server.upload_row(id).await.is_some());
    graphql.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_denied_upload_creates_nothing() {
    let github = MockServer::start_async().await;
    let graphql = mock_read_only(&github).await;
    let server = enforced_server(&github).await;
    let token = server.create_token(&["upload"]).await;

    let query = format!("{}&github_token=gh-user", single_query(REPO));
    let response = server.upload(Some(&token), &query, b"x".to_vec()).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.json["message"],
        "you do not have write permission to this GitHub repository"
    );

    let response = server
        .upload(Some(&token), &single_query(REPO), b"x".to_vec())
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json["message"], "must provide github_token");

    assert!(server.upload_row(1).await.is_none());
    assert!(server.storage.calls().is_empty());
    graphql.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_installation_token_is_allowed() {
    let github = MockServer::start_async().await;
    let installation = github
        .mock_async(|when, then| {
            when.method(GET)
                .path("/installation/repositories")
                .header("authorization", "Bearer gh-inst");
            then.status(200).json_body(json!({
                "total_count": 1,
                "repositories": [{ "full_name": "Acme/Widgets" }]
            }));
        })
        .await;
    let server = enforced_server(&github).await;
    let token = server.create_token(&["upload"]).await;

    let query = format!(
        "repository={REPO}&commit={COMMIT}&multiPart=true&numParts=1&github_token=gh-inst"
    );
    let id = created_id(&server.upload(Some(&token), &query, Vec::new()).await);

    // Parts and finalize ride on the upload id alone.
    let response = server
        .upload(Some(&token), &format!("uploadId={id}&index=0"), b"p".to_vec())
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    let response = server
        .upload(Some(&token), &format!("uploadId={id}&done=true"), Vec::new())
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    installation.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_unsupported_code_host() {
    let github = MockServer::start_async().await;
    let server = enforced_server(&github).await;
    let token = server.create_token(&["upload"]).await;

    let response = server
        .upload(
            Some(&token),
            &format!("{}&github_token=gh", single_query("gitlab.com/acme/widgets")),
            b"x".to_vec(),
        )
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response.json["message"],
        "verification not supported for code host"
    );
}

#[tokio::test]
async fn test_internal_endpoint_skips_code_host() {
    let github = MockServer::start_async().await;
    let graphql = mock_read_only(&github).await;
    let server = enforced_server(&github).await;

    let id = created_id(
        &server
            .internal_upload(&single_query(REPO), b"x".to_vec())
            .await,
    );
    assert!(server.upload_row(id).await.is_some());
    graphql.assert_hits_async(0).await;
}
