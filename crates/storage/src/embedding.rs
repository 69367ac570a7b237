use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|[0-9]+").expect("token regex is valid"));

/// Turns text into a fixed-width vector. Implementations must be deterministic.
pub trait Embedder: Send + Sync {
    fn dims(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashed bag of identifiers, L2-normalized.
///
/// camelCase and snake_case identifiers also contribute their parts, so `parseConfig`
/// lands near `parse_config`.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = md5::compute(token.as_bytes());
        let raw = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((raw % self.dims as u64) as usize, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn sub_tokens(ident: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in ident.split('_').filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut prev_lower = false;
        for ch in piece.chars() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(current.to_lowercase());
                current.clear();
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.push(ch);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

impl Embedder for HashingEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for m in TOKEN.find_iter(text) {
            let token = m.as_str();
            let lower = token.to_lowercase();
            let (i, s) = self.bucket(&lower);
            v[i] += s;
            let parts = sub_tokens(token);
            if parts.len() > 1 {
                for part in parts {
                    let (i, s) = self.bucket(&part);
                    v[i] += 0.5 * s;
                }
            }
        }
        normalize(&mut v);
        v
    }
}

pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// 1 - cosine similarity. Zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("fn parse_config(path: &str)");
        let b = e.embed("fn parse_config(path: &str)");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_similar_text_is_closer() {
        let e = HashingEmbedder::default();
        let q = e.embed("parse the config file");
        let near = e.embed("fn parse_config(file: &Path) -> Config");
        let far = e.embed("render widget tree to canvas");
        assert!(cosine_distance(&q, &near) < cosine_distance(&q, &far));
    }

    #[test]
    fn test_sub_tokens() {
        assert_eq!(sub_tokens("parseConfigFile"), vec!["parse", "config", "file"]);
        assert_eq!(sub_tokens("load_user"), vec!["load", "user"]);
    }

    #[test]
    fn test_empty_text_distance() {
        let e = HashingEmbedder::new(8);
        let z = e.embed("");
        assert_eq!(cosine_distance(&z, &e.embed("x")), 1.0);
    }
}
