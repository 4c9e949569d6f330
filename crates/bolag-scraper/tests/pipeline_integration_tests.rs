//! End-to-end pipeline tests against a mocked upstream: segmentation →
//! id resolution → financial fetch → validation → migration.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use bolag_core::models::{CompanyStatus, Filters, JobStage, JobStatus, JobType};
use bolag_core::{CompanyListOptions, EngineConfig, ProxyConfig, StagingStore};
use bolag_scraper::controller::JobController;
use bolag_scraper::migrator::{InMemoryProductionStore, MigrateOptions};

fn controller_for(
    server: &mockito::Server,
    dir: &TempDir,
    production: Arc<InMemoryProductionStore>,
) -> JobController {
    let config = EngineConfig {
        staging_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let proxy_config = ProxyConfig {
        vpn_enabled: true,
        ..Default::default()
    };
    JobController::new(config, proxy_config, server.url(), production)
}

async fn mock_bootstrap(server: &mut mockito::Server) {
    server
        .mock("GET", "/")
        .with_status(200)
        .with_header("set-cookie", "sid=abc; Path=/")
        .with_body(r#"<input name="__RequestVerificationToken" value="tok-1">"#)
        .create_async()
        .await;
    server
        .mock("GET", "/segmentering")
        .with_status(200)
        .with_body(
            r#"<script id="__NEXT_DATA__" type="application/json">{"buildId":"build1"}</script>"#,
        )
        .create_async()
        .await;
}

async fn wait_for_status(
    controller: &JobController,
    job_id: Uuid,
    wanted: JobStatus,
) -> bolag_scraper::controller::JobView {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = controller.get_job(job_id).await.unwrap();
        if view.status == wanted {
            return view;
        }
        assert!(
            !(view.status.is_terminal() && view.status != wanted),
            "job reached {} while waiting for {}",
            view.status,
            wanted
        );
    }
    panic!("job {} never reached {}", job_id, wanted);
}

#[tokio::test]
async fn test_full_pipeline_stages_validates_and_migrates() {
    let mut server = mockito::Server::new_async().await;
    mock_bootstrap(&mut server).await;

    // stage 1: one listing page with two companies, then empties
    server
        .mock("GET", "/_next/data/build1/segmentation.json")
        .match_query(mockito::Matcher::Regex("page=1&".to_string()))
        .with_status(200)
        .with_body(
            serde_json::json!({
                "pageProps": {
                    "companies": [
                        {
                            "organisationNumber": "5561234567",
                            "displayName": "Alpha AB",
                            "proffIndustries": [{"name": "IT-konsulter"}],
                            "revenue": "120 000",
                            "profit": "9 000"
                        },
                        {
                            "organisationNumber": "5567654321",
                            "displayName": "Beta AB",
                            "revenue": 80000
                        }
                    ],
                    "numberOfHits": 2
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/_next/data/build1/segmentation.json")
        .match_query(mockito::Matcher::Regex(
            "page=([2-9]|[1-9][0-9]+)&".to_string(),
        ))
        .with_status(200)
        .with_body(serde_json::json!({"pageProps": {"companies": []}}).to_string())
        .create_async()
        .await;

    // stage 2: html search hits for both companies
    server
        .mock("GET", "/bransch-sok")
        .match_query(mockito::Matcher::UrlEncoded(
            "q".to_string(),
            "Alpha AB".to_string(),
        ))
        .with_status(200)
        .with_body(r#"<a href="/foretag/alpha-ab/stockholm/AAAAAAAAAAAAA">Alpha AB</a> 556123-4567"#)
        .create_async()
        .await;
    server
        .mock("GET", "/bransch-sok")
        .match_query(mockito::Matcher::UrlEncoded(
            "q".to_string(),
            "Beta AB".to_string(),
        ))
        .with_status(200)
        .with_body(r#"<a href="/foretag/beta-ab/malmo/BBBBBBBBBBBBB">Beta AB</a> 556765-4321"#)
        .create_async()
        .await;

    // stage 3: one filing for Alpha, none for Beta
    server
        .mock("GET", "/_next/data/build1/company/AAAAAAAAAAAAA.json")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(
            serde_json::json!({
                "pageProps": {
                    "company": {
                        "employees": 12,
                        "companyAccounts": [{
                            "year": 2024,
                            "period": "12",
                            "periodStart": "2024-01-01",
                            "periodEnd": "2024-12-31",
                            "accounts": [
                                {"code": "SDI", "amount": "44212"},
                                {"code": "DR", "amount": "5100"},
                                {"code": "EK", "amount": "5666"}
                            ]
                        }]
                    }
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/_next/data/build1/company/BBBBBBBBBBBBB.json")
        .match_query(mockito::Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let production = Arc::new(InMemoryProductionStore::new());
    let controller = controller_for(&server, &dir, production.clone());

    let job_id = controller
        .start_job(
            Filters::from_msek(100, 500, None, None),
            JobType::FullPipeline,
        )
        .await
        .unwrap();

    let view = wait_for_status(&controller, job_id, JobStatus::Done).await;
    assert_eq!(view.total_companies, 2);
    assert_eq!(view.error_count, 0);
    assert_eq!(view.summary.financials_fetched, 2);
    assert_eq!(view.summary.financial_rows, 1);
    assert!(view.rate_limit_stats.is_some());

    // staged rows are queryable through the control surface
    let companies = controller
        .list_companies(
            job_id,
            &CompanyListOptions {
                status: Some(CompanyStatus::FinancialsFetched),
                page: 1,
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(companies.total, 2);
    assert!(controller.list_errors(job_id).await.unwrap().is_empty());

    // validation accepts the staged record
    let validation = controller.validate_job(job_id).await.unwrap();
    assert_eq!(validation.validated, 1);
    assert_eq!(validation.valid, 1);

    // first migration promotes, the second only skips
    let options = MigrateOptions {
        include_warnings: false,
        skip_duplicates: true,
    };
    let first = controller.migrate_job(job_id, options).await.unwrap();
    assert_eq!(first.migrated, 1);
    assert_eq!(first.errors, 0);

    let second = controller.migrate_job(job_id, options).await.unwrap();
    assert_eq!(second.migrated, 0);
    assert_eq!(second.skipped, first.migrated);

    let rows = production.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].company_id, "AAAAAAAAAAAAA");
    assert_eq!(rows[0].revenue, Some(44212));
}

#[tokio::test]
async fn test_proxy_auth_failure_errors_job_with_resumable_checkpoint() {
    let mut server = mockito::Server::new_async().await;
    // every upstream call is rejected at the proxy
    server
        .mock("GET", mockito::Matcher::Any)
        .with_status(407)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let production = Arc::new(InMemoryProductionStore::new());
    let controller = controller_for(&server, &dir, production);

    let job_id = controller
        .start_job(
            Filters::from_msek(100, 500, None, None),
            JobType::FullPipeline,
        )
        .await
        .unwrap();

    let view = wait_for_status(&controller, job_id, JobStatus::Error).await;
    assert!(view
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("credentials"));
    assert_eq!(view.stage, JobStage::Stage1);

    // the error surface names stage 1
    let errors = controller.list_errors(job_id).await.unwrap();
    assert_eq!(errors[0].reason, "Stage 1 segmentation failed");

    // state is preserved for an operator fix + resume
    let store = StagingStore::open(dir.path(), job_id).unwrap();
    let info = store.resume_info(job_id).await.unwrap();
    assert!(info.can_resume);
}

#[tokio::test]
async fn test_pause_and_resume_complete_the_listing() {
    let mut server = mockito::Server::new_async().await;
    mock_bootstrap(&mut server).await;
    // pages 1-20 fill the first fetch batch, so a pause issued right after
    // start is always observed at the batch boundary
    server
        .mock("GET", "/_next/data/build1/segmentation.json")
        .match_query(mockito::Matcher::Regex(
            "page=([1-9]|1[0-9]|20)&".to_string(),
        ))
        .with_status(200)
        .with_body(
            serde_json::json!({
                "pageProps": {
                    "companies": [{"organisationNumber": "5561234567", "displayName": "Alpha AB"}],
                    "numberOfHits": 1
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/_next/data/build1/segmentation.json")
        .match_query(mockito::Matcher::Regex(
            "page=(2[1-9]|[3-9][0-9]|[1-9][0-9]{2,})&".to_string(),
        ))
        .with_status(200)
        .with_body(serde_json::json!({"pageProps": {"companies": []}}).to_string())
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let production = Arc::new(InMemoryProductionStore::new());
    let controller = controller_for(&server, &dir, production);

    // a paused segmentation job resumes into a completed listing
    let job_id = controller
        .start_job(
            Filters::from_msek(100, 500, None, None),
            JobType::Segmentation,
        )
        .await
        .unwrap();
    controller.pause(job_id).await.unwrap();
    let view = wait_for_status(&controller, job_id, JobStatus::Paused).await;
    assert!(view.status.is_resumable());

    // the worker acknowledges the pause cooperatively; wait for it to wind
    // down before re-entering the stage
    while controller.is_live(job_id) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    controller.resume(job_id).await.unwrap();
    let view = wait_for_status(&controller, job_id, JobStatus::Done).await;
    // the single distinct orgnr collapses into one staged row
    assert_eq!(view.summary.total_companies, 1);
    assert!(view.last_page >= 23);
}
