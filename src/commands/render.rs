use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use futures::future::join_all;
use pdfcache_lib::{
    engine_from_env, PdfError, PdfcacheOutput, RenderItem, RenderOutput, RenderService, Viewport,
    PDFCACHE_OUTPUT_VERSION,
};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cli::OutputFormat;
use crate::formatting::{render_error, write_output};
use crate::settings::{resolve_config, Overrides};

pub struct RenderArgs {
    pub config_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub inputs: Vec<String>,
    pub brand: Option<String>,
    pub out_dir: PathBuf,
    pub timeout: Option<u64>,
    pub viewport: Option<Viewport>,
    pub format: OutputFormat,
    pub output: Option<PathBuf>,
}

struct Document {
    label: String,
    stem: String,
    html: String,
}

/// Run the render command.
pub async fn run_render(args: RenderArgs) -> ExitCode {
    let RenderArgs {
        config_path,
        cache_dir,
        inputs,
        brand,
        out_dir,
        timeout,
        viewport,
        format,
        output,
    } = args;

    let overrides = Overrides {
        cache_dir,
        load_timeout_secs: timeout,
        viewport,
        ..Overrides::default()
    };
    let config = match resolve_config(config_path.as_deref(), &overrides) {
        Ok(cfg) => cfg,
        Err(err) => return render_error(err, format, output),
    };

    let documents = match read_documents(&inputs).await {
        Ok(docs) => docs,
        Err(err) => return render_error(err, format, output),
    };
    if let Err(err) = tokio::fs::create_dir_all(&out_dir).await {
        return render_error(PdfError::Io(err), format, output);
    }

    let service = Arc::new(RenderService::new(&config, engine_from_env(&config.engine)));
    let renders = join_all(
        documents
            .iter()
            .map(|doc| render_document(&service, doc, brand.as_deref(), &out_dir)),
    );

    let results = tokio::select! {
        results = renders => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; shutting down");
            service.shutdown().await;
            return render_error(
                PdfError::Unavailable("interrupted before all documents were rendered".to_string()),
                format,
                output,
            );
        }
    };

    let health = service.health_status();
    service.shutdown().await;

    let mut items = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(item) => items.push(item),
            Err(err) => return render_error(err, format, output),
        }
    }

    let body = PdfcacheOutput::Render(RenderOutput {
        version: PDFCACHE_OUTPUT_VERSION.to_string(),
        items,
        health,
    });
    if let Err(err) = write_output(&body, format, output.clone()) {
        return render_error(PdfError::Unknown(err.to_string()), format, output);
    }
    ExitCode::SUCCESS
}

async fn render_document(
    service: &RenderService,
    doc: &Document,
    brand: Option<&str>,
    out_dir: &Path,
) -> Result<RenderItem, PdfError> {
    let started = Instant::now();
    let result = service.render_and_cache(&doc.html, brand).await?;
    let output_path = out_dir.join(format!("{}.pdf", doc.stem));
    tokio::fs::write(&output_path, &result.buffer).await?;
    debug!(input = %doc.label, tier = %result.tier, path = %output_path.display(), "wrote PDF");
    Ok(RenderItem {
        input: doc.label.clone(),
        output_path,
        tier: result.tier,
        bytes: result.buffer.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

async fn read_documents(inputs: &[String]) -> Result<Vec<Document>, PdfError> {
    let mut documents = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (html, stem) = if input == "-" {
            let mut html = String::new();
            tokio::io::stdin().read_to_string(&mut html).await?;
            (html, "stdin".to_string())
        } else {
            let path = Path::new(input);
            let html = tokio::fs::read_to_string(path).await.map_err(|err| {
                PdfError::InvalidInput(format!("Failed to read {}: {}", path.display(), err))
            })?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            (html, stem)
        };
        if html.trim().is_empty() {
            return Err(PdfError::InvalidInput(format!("No HTML provided in {input}")));
        }
        documents.push(Document {
            label: input.clone(),
            stem,
            html,
        });
    }
    Ok(documents)
}
