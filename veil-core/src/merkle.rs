use shared::Hash256;

/// Calcula a raiz de Merkle de uma lista de hashes filhos
///
/// Nível ímpar duplica o último elemento; pares são concatenados e
/// re-hasheados até sobrar um. Lista com um único elemento devolve o próprio
/// elemento; lista vazia devolve o hash zero (nunca ocorre na prática, a
/// coinbase está sempre presente).
#[must_use]
pub fn compute_root(mut level: Vec<Hash256>) -> Hash256 {
    if level.is_empty() {
        return Hash256::zero();
    }

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("nível não vazio"));
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut buf = Vec::with_capacity(Hash256::LEN * 2);
            buf.extend_from_slice(pair[0].as_bytes());
            buf.extend_from_slice(pair[1].as_bytes());
            next.push(Hash256::digest(&buf));
        }
        level = next;
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_element_is_identity() {
        let h = Hash256::digest(b"tx");
        assert_eq!(compute_root(vec![h]), h);
    }

    #[test]
    fn test_odd_list_equals_duplicated_last() {
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");
        let c = Hash256::digest(b"c");

        assert_eq!(
            compute_root(vec![a, b, c]),
            compute_root(vec![a, b, c, c])
        );
    }

    #[test]
    fn test_root_depends_on_order() {
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");
        assert_ne!(compute_root(vec![a, b]), compute_root(vec![b, a]));
    }

    #[test]
    fn test_pair_is_hash_of_concat() {
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");

        let mut buf = Vec::new();
        buf.extend_from_slice(a.as_bytes());
        buf.extend_from_slice(b.as_bytes());
        assert_eq!(compute_root(vec![a, b]), Hash256::digest(&buf));
    }
}
