use anyhow::Context as _;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Conteo de palabras de un split o del agregado final.
pub type WordCounts = BTreeMap<String, u64>;

/// Limpia un token: solo alfanumérico y '_', en minúscula.
fn normalize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn count_words(text: &str) -> WordCounts {
    let mut counts = WordCounts::new();
    for word in text.split_whitespace().filter_map(normalize) {
        *counts.entry(word).or_insert(0) += 1;
    }
    counts
}

/// Suma `from` dentro de `into`. Conmutativa y asociativa.
pub fn merge_counts(into: &mut WordCounts, from: WordCounts) {
    for (word, count) in from {
        *into.entry(word).or_insert(0) += count;
    }
}

pub fn encode_counts(counts: &WordCounts) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(counts)?)
}

pub fn decode_counts(bytes: &[u8]) -> anyhow::Result<WordCounts> {
    serde_json::from_slice(bytes).context("conteos mal codificados")
}

/// Transform del map: texto UTF-8 del split -> conteos en JSON.
/// Función pura de los bytes de entrada.
pub fn word_count_transform(input: &[u8]) -> anyhow::Result<Vec<u8>> {
    let text = std::str::from_utf8(input).context("el split no es UTF-8")?;
    encode_counts(&count_words(text))
}

/// Parte un texto en trozos de a lo sumo `max_bytes`, cortando en espacios.
/// Una palabra más larga que el límite queda sola en su trozo.
/// `max_bytes == 0` devuelve el texto entero. Siempre hay al menos un trozo.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<String> {
    if max_bytes == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.len()
        } else {
            current.len() + 1 + word.len()
        };
        if needed > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// "palabra,conteo" por línea, ordenado por palabra.
pub fn render_csv(counts: &WordCounts) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for (word, count) in counts {
        writer.serialize((word, count))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("csv: {}", e.error()))
}

/// Escribe el CSV de conteos. Crea la carpeta de salida si hace falta y
/// reemplaza el archivo de forma atómica (tmp + rename).
pub fn write_counts_csv(counts: &WordCounts, output_path: &Path) -> anyhow::Result<()> {
    let bytes = render_csv(counts)?;

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp: PathBuf = output_path.with_extension("csv.tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("no se pudo escribir {}", tmp.display()))?;
    fs::rename(&tmp, output_path)?;
    Ok(())
}

/// Lee un archivo de texto, cuenta palabras y escribe "palabra,conteo" en output_path.
pub fn wordcount_file(input_path: &Path, output_path: &Path) -> anyhow::Result<WordCounts> {
    let text = fs::read_to_string(input_path)
        .with_context(|| format!("no se pudo leer {}", input_path.display()))?;
    let counts = count_words(&text);
    write_counts_csv(&counts, output_path)?;
    Ok(counts)
}
