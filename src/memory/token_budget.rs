//! Token 估算
//!
//! 上下文重建按 token 预算裁剪旧消息，这里只做字符计数近似，不依赖具体模型的分词器。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 一组文本的估算总和
    pub fn estimate_all<'a>(texts: impl IntoIterator<Item = &'a str>) -> usize {
        texts.into_iter().map(Self::estimate).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        // 12 个 ASCII 字符 = 3 tokens
        assert_eq!(TokenEstimator::estimate("hello world!"), 3);

        // 6 个中文字符 = 4 tokens
        assert_eq!(TokenEstimator::estimate("你好世界测试"), 4);

        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[test]
    fn test_estimate_all() {
        assert_eq!(TokenEstimator::estimate_all(["hello world!", "abcd"]), 4);
    }
}
