use std::collections::BTreeMap;

/// Cuenta palabras: sólo alfanumérico y '_', en minúscula.
pub fn count_words(text: &str) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for raw in text.split_whitespace() {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_lowercase();

        if !cleaned.is_empty() {
            *counts.entry(cleaned).or_insert(0) += 1;
        }
    }
    counts
}

/// Una línea "palabra,conteo" por palabra, ordenadas.
pub fn render_counts_csv(counts: &BTreeMap<String, u64>) -> String {
    let mut out = String::new();
    for (word, count) in counts {
        out.push_str(word);
        out.push(',');
        out.push_str(&count.to_string());
        out.push('\n');
    }
    out
}

/// Contenido de entrada → CSV del wordcount. Bytes no UTF-8 se reemplazan.
pub fn wordcount_bytes(input: &[u8]) -> Vec<u8> {
    render_counts_csv(&count_words(&String::from_utf8_lossy(input))).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Caso feliz: texto normal, mayúsculas, signos, etc.
    #[test]
    fn wordcount_counts_words_correctly() {
        let input = b"Hola hola, mundo!!\nmundo   mundo_prueba\n";
        let out = String::from_utf8(wordcount_bytes(input)).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["hola,2", "mundo,2", "mundo_prueba,1"]);
    }

    #[test]
    fn wordcount_on_empty_input_is_empty() {
        assert!(wordcount_bytes(b"").is_empty());
        assert!(wordcount_bytes(b"  !!  ,, \n").is_empty());
    }

    #[test]
    fn wordcount_tolerates_invalid_utf8() {
        let out = String::from_utf8(wordcount_bytes(b"test \xff test")).unwrap();
        assert_eq!(out.trim(), "test,2");
    }
}
