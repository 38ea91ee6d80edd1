//! Drives a shell script that imitates the worker. Unix only.

use diffusion_worker::*;
use std::time::Duration;

const WORKER: &str = r#"echo "Model loaded"
while IFS= read -r line; do
  case "$line" in
    generate*)
      echo "Running base model"
      for p in 20 60 100; do printf '%s%%|####| %s/100\r' "$p" "$p"; sleep 0.05; done
      echo ""
      echo "Running refine model"
      printf '50%%|##| 5/10\n'
      echo "Image generated in 0.3s"
      ;;
    stop*) echo "Stopping" ;;
  esac
done
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing("diffusion_worker=debug");

    let dir = tempfile::tempdir()?;
    let script = dir.path().join("worker.sh");
    let model = dir.path().join("sdxl_base.safetensors");
    std::fs::write(&script, WORKER)?;
    std::fs::write(&model, b"weights")?;

    let config = SupervisorConfig::builder()
        .with_silence_threshold(Duration::from_millis(500))
        .with_session_log(dir.path().join("session.log"))
        .build();
    let (mut session, mut events) = WorkerSession::new(config)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", serde_json::to_string(&event).unwrap_or_default());
        }
    });

    let settings = GenerationSettings {
        prompts: vec!["a paper boat".into(), "a glass city".into()],
        iterations: 2,
        refiner_strengths: vec![0.0],
        model,
        ..Default::default()
    };
    let options = RunOptions::new(LaunchSpec::new("/bin/sh").with_script(&script), dir.path().join("out"));

    let summary = session
        .run(&settings, &options, &mut NoWildcards, &PassthroughImages)
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let quiet = session.cancel().await;
    println!("cancelled, quiet = {}", quiet);

    session.shutdown().await;
    drop(session);
    printer.await?;
    Ok(())
}
