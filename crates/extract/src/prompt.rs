use crate::language::Language;
use crate::parser::{COMPLETION_DELIMITER, RECORD_DELIMITER, TUPLE_DELIMITER};
use crate::schema::Chunk;

const ENTITY_TYPES: &str = "PERSON, ORGANIZATION, LOCATION, EVENT, CONCEPT, TECHNOLOGY, WORK, DATE";

pub fn build_extraction_prompt(language: Language, chunk_text: &str) -> String {
    match language {
        Language::English => format!(
            r#"Extract entities and relationships from the following text.

INSTRUCTIONS:
1. Identify every entity. For each one output
   ("entity"{t}<entity_name>{t}<entity_type>{t}<entity_description>)
   entity_type must be one of: {types}
2. Identify every pair of clearly related entities. For each pair output
   ("relationship"{t}<source_entity>{t}<target_entity>{t}<relationship_description>{t}<relationship_strength>)
   relationship_strength is an integer from 1 to 10.
3. Separate records with {r}
4. Finish with {c}
5. Output ONLY the records, no markdown, no explanations.

TEXT:
{text}

OUTPUT:"#,
            t = TUPLE_DELIMITER,
            r = RECORD_DELIMITER,
            c = COMPLETION_DELIMITER,
            types = ENTITY_TYPES,
            text = chunk_text,
        ),
        Language::Chinese => format!(
            r#"从下面的文本中抽取实体和关系。

要求：
1. 找出所有实体，每个实体输出
   ("entity"{t}<实体名称>{t}<实体类型>{t}<实体描述>)
   实体类型必须是以下之一：{types}
2. 找出所有明确相关的实体对，每对输出
   ("relationship"{t}<源实体>{t}<目标实体>{t}<关系描述>{t}<关系强度>)
   关系强度为 1 到 10 的整数。
3. 记录之间用 {r} 分隔
4. 最后输出 {c}
5. 只输出记录，不要使用 markdown，不要解释。

文本：
{text}

输出："#,
            t = TUPLE_DELIMITER,
            r = RECORD_DELIMITER,
            c = COMPLETION_DELIMITER,
            types = ENTITY_TYPES,
            text = chunk_text,
        ),
    }
}

/// Section label for the `index`-th (1-based) text of a merged prompt.
pub fn text_marker(language: Language, index: usize) -> String {
    match language {
        Language::English => format!("[Text {index}]"),
        Language::Chinese => format!("[文本{index}]"),
    }
}

/// One prompt covering several chunks, each under its own `[Text i]` label.
pub fn build_merged_extraction_prompt(language: Language, chunks: &[Chunk]) -> String {
    let instruction = match language {
        Language::English => format!(
            "You will see {n} text fragments. Extract entities and relationships for each \
             fragment separately, and start the output for each fragment with its label \
             (e.g. {first}, {second}).",
            n = chunks.len(),
            first = text_marker(language, 1),
            second = text_marker(language, 2),
        ),
        Language::Chinese => format!(
            "你将看到{n}个文本片段。请为每个文本片段分别抽取实体和关系，并在每个片段的输出前标注其编号（例如：{first}、{second}）。",
            n = chunks.len(),
            first = text_marker(language, 1),
            second = text_marker(language, 2),
        ),
    };

    let mut merged = String::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        merged.push_str(&text_marker(language, idx + 1));
        merged.push('\n');
        merged.push_str(&chunk.content);
        merged.push_str("\n\n");
    }

    build_extraction_prompt(language, &format!("{instruction}\n\n{merged}"))
}

pub fn build_summary_prompt(language: Language, name: &str, descriptions: &[&str]) -> String {
    let list = descriptions
        .iter()
        .map(|d| format!("- {d}"))
        .collect::<Vec<_>>()
        .join("\n");

    match language {
        Language::English => format!(
            r#"You are given one entity or relationship from a knowledge graph and a list of descriptions of it.
Write a single, coherent summary that keeps every distinct fact and resolves contradictions.
Write in the third person and mention the name explicitly.

NAME: {name}

DESCRIPTIONS:
{list}

SUMMARY:"#
        ),
        Language::Chinese => format!(
            r#"下面给出知识图谱中的一个实体或关系及其若干描述。
请写出一段连贯的综合描述，保留所有不同的事实并消除矛盾。
使用第三人称，并明确提及名称。

名称：{name}

描述列表：
{list}

综合描述："#
        ),
    }
}
