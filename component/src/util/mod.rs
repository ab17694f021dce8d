use alloc::format;
use alloc::string::String;

mod ceil;

pub fn human_size(size: usize) -> String {
    const K: usize = 1024;
    const M: usize = K * K;
    const G: usize = M * K;

    if size < K {
        format!("{}B", size)
    } else if size < M {
        let kbs = size / K;
        let rest = size % K;
        if rest == 0 {
            format!("{}KiB", kbs)
        } else {
            format!("{}KiB+{}", kbs, human_size(rest))
        }
    } else if size < G {
        let mbs = size / M;
        let rest = size % M;
        if rest == 0 {
            format!("{}MiB", mbs)
        } else {
            format!("{}MiB+{}", mbs, human_size(rest))
        }
    } else {
        panic!("Too large size for {} Bytes", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_exact_units() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1024), "1KiB");
        assert_eq!(human_size(8 * 1024 * 1024), "8MiB");
    }

    #[test]
    fn human_size_mixed() {
        assert_eq!(human_size(1024 + 512), "1KiB+512B");
        assert_eq!(human_size(2 * 1024 * 1024 + 3 * 1024), "2MiB+3KiB");
    }
}
