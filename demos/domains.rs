use forgepool::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ImageOperation {
    Grayscale { pixels: Vec<[u8; 3]> },
    Invert { pixels: Vec<[u8; 3]> },
}

impl Operation for ImageOperation {
    fn validate(&self) -> PoolResult<()> {
        match self {
            ImageOperation::Grayscale { pixels } | ImageOperation::Invert { pixels }
                if pixels.is_empty() =>
            {
                Err(PoolError::invalid_operation("image has no pixels"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct ImageHandler {
    processed: usize,
}

#[async_trait]
impl OperationHandler<ImageOperation> for ImageHandler {
    async fn run(&mut self, operation: ImageOperation) -> HandlerResult {
        self.processed += 1;
        let pixels: Vec<[u8; 3]> = match operation {
            ImageOperation::Grayscale { pixels } => pixels
                .into_iter()
                .map(|[r, g, b]| {
                    let y = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
                    [y as u8; 3]
                })
                .collect(),
            ImageOperation::Invert { pixels } => pixels
                .into_iter()
                .map(|[r, g, b]| [255 - r, 255 - g, 255 - b])
                .collect(),
        };

        Ok(json!({"pixels": pixels, "handled_by_this_worker": self.processed}))
    }
}

async fn general(task_type: String, data: Value) -> HandlerResult {
    match task_type.as_str() {
        "checksum" => {
            let text = data["text"].as_str().ok_or("missing 'text'")?;
            let sum = text
                .bytes()
                .fold(0u32, |acc, byte| acc.rotate_left(5) ^ byte as u32);
            Ok(json!(sum))
        }
        "sleep" => {
            let ms = data["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        }
        other => Err(format!("Unknown task type: {}", other).into()),
    }
}

#[tokio::main]
async fn main() -> PoolResult<()> {
    let config = RegistryConfig::standard()
        .with_pool(PoolDomain::Image.name(), PoolConfig::with_workers(1, 4));
    config.logging.init()?;

    let registry = PoolRegistry::builder()
        .with_config(config.clone())
        .domain(
            PoolDomain::Image,
            WorkerEntry::typed::<ImageOperation, _, _>("image", ImageHandler::default),
        )
        .domain(PoolDomain::General, WorkerEntry::from_fn("general", general))
        .build()
        .await?;

    let image = registry.get_domain(PoolDomain::Image)?;
    let general = registry.get_domain(PoolDomain::General)?;

    let gray = image.submit::<_, Value>(
        &ImageOperation::Grayscale {
            pixels: vec![[255, 0, 0], [0, 255, 0]],
        },
        TaskOptions::new(),
    );
    let inverted = image.submit::<_, Value>(
        &ImageOperation::Invert {
            pixels: vec![[10, 20, 30]],
        },
        TaskOptions::new().with_priority(10),
    );
    let checksum = general.execute::<_, u32>(
        "checksum",
        json!({"text": "forgepool"}),
        TaskOptions::new(),
    );
    let too_slow = general.execute::<_, Value>(
        "sleep",
        json!({"ms": 500}),
        TaskOptions::new().with_timeout(Duration::from_millis(50)),
    );

    println!("🔨 grayscale: {}", gray.await?);
    println!("🔨 inverted:  {}", inverted.await?);
    println!("🔨 checksum:  {}", checksum.await?);
    match too_slow.await {
        Err(e @ PoolError::TaskTimeout { .. }) => println!("🔨 expected timeout: {}", e),
        other => println!("🔨 unexpected: {:?}", other),
    }

    let rejected: PoolResult<Value> = image
        .submit(&ImageOperation::Invert { pixels: vec![] }, TaskOptions::new())
        .await;
    println!("🔨 rejected before enqueue: {:?}", rejected.err());

    for (name, stats) in registry.stats() {
        println!("🔨 {:<8} {}", name, serde_json::to_string(&stats)?);
    }
    for worker in image.workers().await {
        println!("🔨 image worker {:?}", worker);
    }

    registry.shutdown_all(config.shutdown_timeout()).await;
    println!("🔨 All pools stopped");
    Ok(())
}
