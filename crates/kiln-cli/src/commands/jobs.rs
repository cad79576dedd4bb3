//! Job commands.

use anyhow::{Context, Result};
use kiln_core::{JobId, NewJob};
use kiln_scheduler::JobQueue;

pub async fn enqueue(
    queue: &JobQueue,
    job_type: String,
    channel: String,
    args: &str,
    dependencies: Vec<JobId>,
) -> Result<()> {
    let args: serde_json::Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    let job = NewJob::new(job_type, channel)
        .with_args(args)
        .with_dependencies(dependencies);

    let id = queue.enqueue(job).await?;
    println!("{}", id);
    Ok(())
}

pub async fn show(queue: &JobQueue, id: JobId) -> Result<()> {
    let job = queue.job(id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn roots(queue: &JobQueue) -> Result<()> {
    for id in queue.all_root_job_ids().await? {
        println!("{}", id);
    }
    Ok(())
}

pub async fn cancel(queue: &JobQueue, id: JobId) -> Result<()> {
    queue.cancel_job(id).await?;
    println!("Cancellation requested for {}", id);
    Ok(())
}

pub async fn delete(queue: &JobQueue, id: JobId) -> Result<()> {
    queue.delete_job(id).await?;
    println!("Deleted {}", id);
    Ok(())
}
