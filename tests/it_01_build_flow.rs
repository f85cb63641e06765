use lambda_build_models::{BuildError, Stage};
use lambda_build_packaging::{BuildCache, BuildService, ProjectLoader};
use lambda_build_testsupport::*;

#[tokio::test]
async fn builds_project_end_to_end() -> anyhow::Result<()> {
    let project = TestProject::new("requests==2.31.0\ninternal-sdk @ git+https://github.com/acme/internal-sdk.git@v1.4.0\n")?;
    let backend = FakeBackend::new();
    let service = BuildService::new(project.config(), backend.clone());

    let outcome = service.build(Some(test_secret())).await?;

    assert!(!outcome.cached);
    assert_eq!(outcome.layers.last().map(|l| l.stage), Some(Stage::Entrypoint));
    assert_eq!(backend.tagged("lambda-build/function:latest").await, Some(outcome.image_id.clone()));

    let image = backend.image(&outcome.image_id).await.unwrap();
    assert_eq!(image.files.get("/var/task/main.py").map(Vec::as_slice), Some(HANDLER_SOURCE.as_bytes()));
    assert!(image.files.values().all(|d| !String::from_utf8_lossy(d).contains(TEST_SECRET)));

    let report = outcome.audit.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.entries_scanned, 3);
    Ok(())
}

#[tokio::test]
async fn missing_secret_is_reported_at_credential_rewrite() -> anyhow::Result<()> {
    let project = TestProject::new("requests==2.31.0\n")?;
    let backend = FakeBackend::new();
    let service = BuildService::new(project.config(), backend.clone());

    let err = service.build(None).await.unwrap_err();

    assert_eq!(err.to_error_shape().stage, Some(Stage::CredentialRewrite));
    assert_eq!(err.error_type(), "MissingCredential");
    assert!(backend.recorded_steps().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn conflict_leaves_no_tag() -> anyhow::Result<()> {
    let project = TestProject::new("pkg-a>=1.0\npkg-a<1.0\n")?;
    let backend = FakeBackend::new();
    let service = BuildService::new(project.config(), backend.clone());

    let err = service.build(Some(test_secret())).await.unwrap_err();

    assert!(matches!(err, BuildError::ConstraintConflict { .. }));
    assert_eq!(backend.tagged("lambda-build/function:latest").await, None);
    assert!(backend.recorded_steps().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn zip_source_is_accepted() -> anyhow::Result<()> {
    let project = TestProject::new("")?;
    let mut config = project.config();
    config.source.path = project.zip_source()?;
    let backend = FakeBackend::new();

    let outcome = BuildService::new(config, backend.clone())
        .build(Some(test_secret()))
        .await?;

    let image = backend.image(&outcome.image_id).await.unwrap();
    assert!(image.files.contains_key("/var/task/main.py"));
    Ok(())
}

#[tokio::test]
async fn cache_reuses_image_for_unchanged_recipe() -> anyhow::Result<()> {
    let project = TestProject::new("requests==2.31.0\n")?;
    let mut config = project.config();
    config.cache.enabled = true;
    let backend = FakeBackend::new();
    let service = BuildService::new(config, backend.clone());

    let first = service.build(Some(test_secret())).await?;
    let steps = backend.recorded_steps().await.len();
    let second = service.build(Some(test_secret())).await?;

    assert!(second.cached);
    assert_eq!(second.image_id, first.image_id);
    assert!(second.audit.as_ref().is_some_and(|a| a.is_clean()));
    assert_eq!(backend.recorded_steps().await.len(), steps);

    project.write("function/main.py", "def lambda_handler(event, context):\n    return 1\n")?;
    let third = service.build(Some(test_secret())).await?;
    assert!(!third.cached);
    assert_ne!(third.image_id, first.image_id);
    Ok(())
}

#[tokio::test]
async fn cache_miss_when_image_was_removed() -> anyhow::Result<()> {
    let project = TestProject::new("")?;
    let mut config = project.config();
    config.cache.enabled = true;
    let backend = FakeBackend::new();
    let service = BuildService::new(config, backend.clone());

    let first = service.build(Some(test_secret())).await?;
    backend.images.lock().await.remove(&first.image_id);

    let second = service.build(Some(test_secret())).await?;
    assert!(!second.cached);
    Ok(())
}

#[tokio::test]
async fn cached_image_is_audited_before_reuse() -> anyhow::Result<()> {
    let project = TestProject::new("sdk @ git+https://github.com/acme/sdk.git@v1.4.0\n")?;
    let backend = FakeBackend::new();
    backend.leak_secret_to("/root/.gitconfig").await;

    let mut unaudited = project.config();
    unaudited.cache.enabled = true;
    unaudited.output.audit = false;
    unaudited.output.tag = "acme/fn:unaudited".to_string();
    let first = BuildService::new(unaudited.clone(), backend.clone())
        .build(Some(test_secret()))
        .await?;
    assert!(first.audit.is_none());

    let mut audited = unaudited.clone();
    audited.output.audit = true;
    audited.output.tag = "acme/fn:audited".to_string();
    let err = BuildService::new(audited.clone(), backend.clone())
        .build(Some(test_secret()))
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::SecretLeak { .. }), "{err}");
    assert_eq!(backend.tagged("acme/fn:audited").await, None);
    assert_eq!(backend.tagged("acme/fn:unaudited").await, Some(first.image_id));
    assert!(BuildCache::new(audited.cache.dir.clone())?.is_empty());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn preflight_rejects_unreachable_dependency() -> anyhow::Result<()> {
    let project = TestProject::new("sdk @ git+https://github.com/acme/sdk.git@release/2.x\n")?;
    let mut config = project.config();
    config.vcs.preflight = true;
    config.vcs.git_binary = project.stub_git(128)?.display().to_string();
    let backend = FakeBackend::new();

    let err = BuildService::new(config, backend.clone())
        .build(Some(test_secret()))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::CredentialRewrite));
    assert!(!err.to_string().contains(TEST_SECRET));
    assert_eq!(project.git_calls().len(), 1);
    assert!(project.git_calls()[0].ends_with("ls-remote --exit-code https://github.com/acme/sdk.git HEAD"));
    assert!(backend.recorded_steps().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn inspect_reads_entrypoint_label() -> anyhow::Result<()> {
    let project = TestProject::new("")?;
    let backend = FakeBackend::new();
    let service = BuildService::new(project.config(), backend.clone());

    service.build(Some(test_secret())).await?;
    let entrypoint = service.inspect("lambda-build/function:latest").await?;

    assert_eq!(entrypoint.map(|e| e.to_string()), Some("main.lambda_handler".to_string()));
    assert!(service.inspect("missing:latest").await.is_err());
    Ok(())
}

#[test]
fn render_shows_mount_but_no_secret() -> anyhow::Result<()> {
    let project = TestProject::new("internal-sdk @ git+https://github.com/acme/internal-sdk.git@v1.4.0\n")?;
    let config = project.config();

    let dockerfile = ProjectLoader::new(&config).render()?;

    assert!(dockerfile.starts_with("FROM public.ecr.aws/lambda/python:3.12\n"));
    assert!(dockerfile.contains("# credential-rewrite: https://github.com/ via secret 'vcs_token'"));
    assert!(dockerfile.contains("--mount=type=secret,id=vcs_token,required=true"));
    assert!(dockerfile.contains("COPY src/ /var/task/"));
    assert!(dockerfile.contains("CMD [\"main.lambda_handler\"]"));
    assert!(!dockerfile.contains(TEST_SECRET));
    Ok(())
}

#[test]
fn check_reports_plan() -> anyhow::Result<()> {
    let project = TestProject::new("requests==2.31.0\ninternal-sdk @ git+https://github.com/acme/internal-sdk.git@v1.4.0\n")?;
    let config = project.config();

    let report = ProjectLoader::new(&config).check()?;

    assert_eq!(report.stages.len(), 7);
    assert_eq!(report.stages[3], Stage::CredentialRewrite);
    assert_eq!(report.packages, 2);
    assert_eq!(report.vcs_packages, 1);
    assert!(report.references_prefix);
    assert!(!report.base_pinned);
    Ok(())
}
