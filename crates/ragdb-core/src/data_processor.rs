use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{MetaValue, SourceDocument};

/// Turns a directory of `.txt` files into [`SourceDocument`]s for bulk ingestion.
#[derive(Default)]
pub struct DataProcessor;

impl DataProcessor {
    pub fn new() -> Self { Self }

    pub fn load_directory(&self, data_dir: &Path) -> Result<Vec<SourceDocument>> {
        self.load_directory_limited(data_dir, usize::MAX)
    }

    pub fn load_directory_limited(&self, data_dir: &Path, limit: usize) -> Result<Vec<SourceDocument>> {
        let mut files = self.list_txt_files(data_dir);
        if files.is_empty() {
            tracing::warn!(dir = %data_dir.display(), "no .txt files found");
            return Ok(vec![]);
        }
        if files.len() > limit {
            files.truncate(limit);
            tracing::info!(limit, "limited directory load");
        }
        let mut documents = Vec::with_capacity(files.len());
        for file_path in &files {
            let text = self.read_file_content(file_path)?;
            if text.trim().is_empty() { continue; }
            documents.push(self.to_document(file_path, data_dir, text));
        }
        tracing::info!(files = files.len(), documents = documents.len(), dir = %data_dir.display(), "loaded documents");
        Ok(documents)
    }

    fn to_document(&self, file_path: &Path, data_dir: &Path, text: String) -> SourceDocument {
        let relative = file_path.strip_prefix(data_dir).unwrap_or(file_path);
        let stem = self.extract_doc_id(file_path);
        let mut doc = SourceDocument::new(stem.clone(), text);
        doc.title = Some(stem);
        doc.source = Some(relative.to_string_lossy().to_string());
        doc.timestamp = fs::metadata(file_path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from);
        doc.extra.insert("category".into(), MetaValue::Str(self.get_facet_from_path(relative)));
        doc
    }

    fn read_file_content(&self, file_path: &Path) -> Result<String> {
        match fs::read_to_string(file_path) {
            Ok(content) => Ok(content),
            Err(_) => Ok(String::from_utf8_lossy(&fs::read(file_path)?).to_string()),
        }
    }

    fn extract_doc_id(&self, file_path: &Path) -> String {
        file_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "document".to_string())
    }

    fn get_facet_from_path(&self, relative: &Path) -> String {
        match relative.parent().and_then(|p| p.to_str()) {
            Some(parent) if !parent.is_empty() => format!("/{}", parent.replace('\\', "/")),
            _ => "/misc".to_string(),
        }
    }

    fn list_txt_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut txt_files = Vec::new();
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()).filter(|e| e.file_type().is_file()) {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("txt") { txt_files.push(path.to_path_buf()); }
        }
        txt_files.sort();
        txt_files
    }
}
