use ragdb_core::config::Config;
use ragdb_embed::build_embedder;

fn main() -> anyhow::Result<()> {
    let settings = Config::load()?.settings()?;
    let embedder = build_embedder(&settings.embedder)?;
    let texts = vec!["hello world".to_string(), "rust embeddings".to_string()];
    let embs = embedder.embed_batch(&texts)?;
    println!("embedder={} B={} dim={}", embedder.embedder_id(), embs.len(), embedder.dim());
    Ok(())
}
