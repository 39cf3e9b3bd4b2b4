//! Manifest 文本修改
//!
//! 按行扫描 YAML，只改写目标服务块内第一行 `image:` 的 tag，
//! 文件其余部分逐字节保留。不做完整解析，同名 key 出现多次时以第一个含 `image:` 的块为准。

use regex::Regex;
use std::sync::LazyLock;

use crate::error::DeployError;

/// 读取服务当前的镜像 tag
pub fn extract_tag(yaml: &str, service: &str) -> Option<String> {
    let (_, line) = find_image_line(yaml, service)?;
    let span = ImageSpan::locate(line)?;
    span.tag(line).map(String::from)
}

/// 把服务镜像的 tag 替换为 `new_tag`
///
/// 目标服务或其 `image:` 行不存在时原样返回
pub fn patch_tag(yaml: &str, service: &str, new_tag: &str) -> String {
    let Some((offset, line)) = find_image_line(yaml, service) else {
        return yaml.to_string();
    };
    let Some(span) = ImageSpan::locate(line) else {
        return yaml.to_string();
    };

    let replace_from = span.tag_start.map_or(span.name_end, |start| start - 1);
    let mut patched = String::with_capacity(yaml.len() + new_tag.len());
    patched.push_str(&yaml[..offset + replace_from]);
    patched.push(':');
    patched.push_str(new_tag);
    patched.push_str(&yaml[offset + span.ref_end..]);
    patched
}

/// 服务 key 是否存在（任意缩进）
pub fn validate_service_exists(yaml: &str, service: &str) -> bool {
    let pattern = format!(r#"(?m)^\s*["']?{}["']?\s*:"#, regex::escape(service));
    Regex::new(&pattern).is_ok_and(|re| re.is_match(yaml))
}

/// 提交前清理
///
/// 拒绝空内容，tab 换成两个空格，去掉行尾空白，
/// 连续 3 个以上空行压缩为 1 个，结尾恰好一个换行
pub fn clean(yaml: &str) -> Result<String, DeployError> {
    if yaml.trim().is_empty() {
        return Err(DeployError::ManifestValidation("manifest is empty".to_string()));
    }

    let lines: Vec<String> = yaml
        .lines()
        .map(|line| line.replace('\t', "  ").trim_end().to_string())
        .collect();

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if !lines[i].is_empty() {
            out.push(&lines[i]);
            i += 1;
            continue;
        }
        let run = lines[i..].iter().take_while(|l| l.is_empty()).count();
        let keep = if run >= 3 { 1 } else { run };
        out.extend(std::iter::repeat("").take(keep));
        i += run;
    }

    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }

    let mut cleaned = out.join("\n");
    cleaned.push('\n');
    Ok(cleaned)
}

/// 只有 key 没有值的行（块的开头）
static BLOCK_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^\s*["']?([^\s"'#:][^"'#:]*?)["']?\s*:\s*(#.*)?$"#).ok());

/// 找到目标服务块内第一行 `image:`，返回 (行起始偏移, 行内容不含换行)
fn find_image_line<'a>(yaml: &'a str, service: &str) -> Option<(usize, &'a str)> {
    let block_key = BLOCK_KEY.as_ref()?;
    let mut offset = 0;
    let mut block_indent: Option<usize> = None;

    for raw in yaml.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        let line_offset = offset;
        offset += raw.len();

        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();

        if let Some(target_indent) = block_indent {
            if indent > target_indent {
                if trimmed.starts_with("image:") {
                    return Some((line_offset, line));
                }
                continue;
            }
            // 回到同级或更浅的缩进，目标块结束，继续找下一个同名块
            block_indent = None;
        }

        if let Some(caps) = block_key.captures(line) {
            if &caps[1] == service {
                block_indent = Some(indent);
            }
        }
    }
    None
}

/// `image:` 行内镜像引用的字节位置
#[derive(Debug)]
struct ImageSpan {
    /// 仓库名结束位置（tag 分隔符或 digest 之前）
    name_end: usize,
    /// tag 起始位置（分隔符 ':' 之后）
    tag_start: Option<usize>,
    /// tag 结束位置（digest 之前）
    tag_end: usize,
    /// 整个引用（含 digest）结束位置
    ref_end: usize,
}

impl ImageSpan {
    fn locate(line: &str) -> Option<Self> {
        let key = line.find("image:")?;
        let after_key = key + "image:".len();
        let rest = &line[after_key..];

        let leading = rest.len() - rest.trim_start().len();
        let mut start = after_key + leading;
        let mut end = line[start..]
            .find(" #")
            .map_or(line.len(), |i| start + i);
        end = start + line[start..end].trim_end().len();

        // 去掉引号
        let bytes = line.as_bytes();
        if end > start && (bytes[start] == b'"' || bytes[start] == b'\'') {
            let quote = bytes[start];
            start += 1;
            if end > start && bytes[end - 1] == quote {
                end -= 1;
            }
        }
        if end <= start {
            return None;
        }

        let reference = &line[start..end];
        let name_part_end = reference.find('@').map_or(end, |i| start + i);
        let last_slash = line[start..name_part_end].rfind('/').map_or(start, |i| start + i + 1);
        let tag_sep = line[last_slash..name_part_end].rfind(':').map(|i| last_slash + i);

        Some(Self {
            name_end: tag_sep.unwrap_or(name_part_end),
            tag_start: tag_sep.map(|i| i + 1),
            tag_end: name_part_end,
            ref_end: end,
        })
    }

    fn tag<'a>(&self, line: &'a str) -> Option<&'a str> {
        let start = self.tag_start?;
        Some(&line[start..self.tag_end]).filter(|t| !t.is_empty())
    }
}
