use chrono::NaiveDate;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetdesk::customers::{ApprovalStatus, PocType};
use fleetdesk::error::Error;
use fleetdesk::prelude::*;

fn pending_customer() -> serde_json::Value {
    json!({
        "id": 7,
        "customer_name": "Acme Freight",
        "customer_email": "ops@acme.test",
        "poc_type": "free_poc",
        "poc_duration": 30,
        "poc_start_date": "2024-01-01",
        "poc_end_date": null,
        "status": "active",
        "approval_status": "pending",
        "extension_count": null
    })
}

#[tokio::test]
async fn test_approval_round_trip_against_rest_api() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/customers"))
        .and(header("apikey", "fake-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([pending_customer()])))
        .mount(&mock_server)
        .await;

    let mut approved = pending_customer();
    approved["approval_status"] = json!("approved");
    approved["poc_end_date"] = json!("2024-01-31");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/customers"))
        .and(query_param("id", "eq.7"))
        .and(header("Prefer", "return=representation"))
        .and(body_partial_json(json!({
            "approval_status": "approved",
            "poc_end_date": "2024-01-31"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([approved])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/email_logs"))
        .and(body_partial_json(json!([{ "customer_id": 7, "email_type": "customer_onboarded" }])))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{ "id": 1 }])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let desk = FleetDesk::new(&mock_server.uri(), "fake-key");
    desk.customers().reload().await.unwrap();
    assert_eq!(desk.customers().pending().len(), 1);

    let customer = desk.customers().approve(7).await.unwrap();

    assert_eq!(customer.approval_status, ApprovalStatus::Approved);
    assert_eq!(customer.poc_end_date, NaiveDate::from_ymd_opt(2024, 1, 31));
    assert_eq!(customer.extension_count, 0);
}

#[tokio::test]
async fn test_backend_rejection_surfaces_api_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/customers"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint",
            "details": null,
            "hint": null
        })))
        .mount(&mock_server)
        .await;

    let desk = FleetDesk::new(&mock_server.uri(), "fake-key");
    let form = NewCustomer::new("Acme Freight", "ops@acme.test", PocType::FreePoc);
    let err = desk.customers().create(form).await.unwrap_err();

    match &err {
        Error::Api { details, status } => {
            assert_eq!(*status, 409);
            assert_eq!(details.code.as_deref(), Some("23505"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        err.user_message(),
        "Request failed: duplicate key value violates unique constraint"
    );
}

#[tokio::test]
async fn test_invalid_email_never_reaches_backend() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/customers"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let desk = FleetDesk::new(&mock_server.uri(), "fake-key");
    let form = NewCustomer::new("Acme Freight", "not-an-email", PocType::FreePoc);
    let err = desk.customers().create(form).await.unwrap_err();

    assert!(err.is_user_facing());
}
