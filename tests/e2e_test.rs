//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL database running (with migrations applied)
//! 2. Redis running
//! 3. API server running on configured port
//! 4. Worker process running
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

const JOB_TIMEOUT: Duration = Duration::from_secs(60);

fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

async fn upload_csv(
    client: &reqwest::Client,
    base_url: &str,
    workspace_id: Uuid,
    entity_type: &str,
    csv: String,
) -> TestResult<reqwest::Response> {
    let part = reqwest::multipart::Part::text(csv)
        .file_name(format!("{}.csv", entity_type))
        .mime_str("text/csv")?;
    let form = reqwest::multipart::Form::new().part("file", part);

    Ok(client
        .post(format!(
            "{}/workspaces/{}/import/{}",
            base_url, workspace_id, entity_type
        ))
        .header("x-user-id", Uuid::new_v4().to_string())
        .multipart(form)
        .send()
        .await?)
}

async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    workspace_id: Uuid,
    entity_type: &str,
    csv: String,
) -> TestResult<Uuid> {
    let response = upload_csv(client, base_url, workspace_id, entity_type, csv).await?;
    if response.status() != reqwest::StatusCode::ACCEPTED {
        return Err(format!("upload returned {}", response.status()).into());
    }
    let body: Value = response.json().await?;
    Ok(body["job_id"].as_str().ok_or("missing job_id")?.parse()?)
}

/// Poll the job until it reaches a terminal status.
async fn wait_for_job(client: &reqwest::Client, base_url: &str, job_id: Uuid) -> TestResult<Value> {
    let started = Instant::now();
    loop {
        let job: Value = client
            .get(format!("{}/import-jobs/{}", base_url, job_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match job["status"].as_str() {
            Some("completed" | "failed" | "cancelled") => return Ok(job),
            _ if started.elapsed() > JOB_TIMEOUT => {
                return Err(format!("job {} did not finish: {}", job_id, job).into())
            }
            _ => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    }
}

fn item_rows(prefix: &str, rows: usize) -> String {
    let mut csv = String::from("SKU,Name,Description,Min Stock Level\n");
    for n in 1..=rows {
        csv.push_str(&format!("{}-{:05},Item {},\"Shelf item, size {}\",{}\n", prefix, n, n, n % 7, n % 3));
    }
    csv
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore]
async fn test_e2e_import_with_row_errors() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let workspace_id = Uuid::new_v4();
    let prefix = Uuid::new_v4().simple().to_string();

    let mut csv = item_rows(&prefix, 250);
    csv.push_str(&format!("{}-bad,,no name,1\n", prefix));
    csv.push_str(&format!("{}-neg,Negative,,-4\n", prefix));

    let job_id = submit(&client, &base_url, workspace_id, "item", csv)
        .await
        .expect("Failed to upload");
    let job = wait_for_job(&client, &base_url, job_id)
        .await
        .expect("Failed to wait for job");

    assert_eq!(job["status"], "completed");
    assert_eq!(job["total_rows"], 252);
    assert_eq!(job["success_count"], 250);
    assert_eq!(job["error_count"], 2);
    assert_eq!(job["progress"], 100);

    let errors: Value = client
        .get(format!("{}/import-jobs/{}/errors", base_url, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows: Vec<i64> = errors["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["row_number"].as_i64().unwrap())
        .collect();
    assert_eq!(rows, vec![251, 252]);
    assert_eq!(errors["errors"][1]["field_name"], "min_stock_level");
}

#[tokio::test]
#[ignore]
async fn test_e2e_rejects_bad_uploads() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let workspace_id = Uuid::new_v4();

    let response = upload_csv(&client, &base_url, workspace_id, "invoice", "a\n1\n".into())
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = upload_csv(&client, &base_url, workspace_id, "item", String::new())
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore]
async fn test_e2e_missing_column_fails_job() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let job_id = submit(
        &client,
        &base_url,
        Uuid::new_v4(),
        "inventory",
        "sku,locaton,quantity\nA-1,Garage,3\n".to_string(),
    )
    .await
    .unwrap();
    let job = wait_for_job(&client, &base_url, job_id).await.unwrap();

    assert_eq!(job["status"], "failed");
    let message = job["error_message"].as_str().unwrap();
    assert!(message.contains("'location' (found 'locaton')"), "{}", message);
}

#[tokio::test]
#[ignore]
async fn test_e2e_cancel_large_import() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let prefix = Uuid::new_v4().simple().to_string();

    let job_id = submit(&client, &base_url, Uuid::new_v4(), "item", item_rows(&prefix, 20_000))
        .await
        .unwrap();

    let response = client
        .post(format!("{}/import-jobs/{}/cancel", base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let job = wait_for_job(&client, &base_url, job_id).await.unwrap();
    assert_eq!(job["status"], "cancelled");
    assert!(job["processed_rows"].as_i64().unwrap() < 20_000);

    let response = client
        .post(format!("{}/import-jobs/{}/cancel", base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
#[ignore]
async fn test_e2e_concurrent_imports() {
    let base_url = get_base_url();
    let workspace_id = Uuid::new_v4();

    let mut tasks = Vec::new();
    for batch in 0..3 {
        let base_url = base_url.clone();
        tasks.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let prefix = format!("{}-{}", Uuid::new_v4().simple(), batch);
            let job_id = submit(&client, &base_url, workspace_id, "item", item_rows(&prefix, 500)).await?;
            wait_for_job(&client, &base_url, job_id).await
        }));
    }

    for result in futures::future::join_all(tasks).await {
        let job = result.expect("task panicked").expect("import failed");
        assert_eq!(job["status"], "completed");
        assert_eq!(job["success_count"], 500);
        assert_eq!(job["error_count"], 0);
    }

    let listed: Value = reqwest::Client::new()
        .get(format!("{}/workspaces/{}/import-jobs", base_url, workspace_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 3);
}
