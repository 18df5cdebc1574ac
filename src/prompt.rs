use crate::completion::CompletionRequest;
use crate::config::{GlossaryPlacement, ModelKind};
use crate::glossary::Glossary;

pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一位精通中日文化的专业轻小说翻译专家。\
请将用户输入的日文轻小说片段翻译成流畅、地道的中文。\n\n\
核心翻译原则：\n\
1. 忠实原文：准确传达原文含义，不增加、不删减、不改写任何内容，不添加原文没有的语气词。\n\
2. 本土化表达：使用简洁、符合中文书面语习惯的自然语句，避免日式直译和机翻腔调。\n\
3. 世界观：完整保留专有名词、魔法体系、等级制度等设定元素。\n\
4. 角色语气：保留原文角色的说话风格，但不要过度演绎。\n\
5. 段落：对话使用「」。原文中语意连贯的相邻短句可合并，仅在话题转换、场景切换或原文明确分段处另起新段。\n\
6. 术语统一：严格遵守术语表中的译名，同一专有名词与人名在全文中使用完全相同的译名。\n\
7. 纯净输出：只输出翻译正文，严禁输出译者注、脚注、说明文字或任何 meta 内容。\n\n\
翻译风格：简洁准确，紧贴原文，不添加原文没有的修辞和语气。\n";

pub const CONTEXT_HEADER: &str = "[前文翻译参考（仅供保持人名、称谓、术语一致，请勿翻译此部分）]";
pub const SOURCE_HEADER: &str = "[待翻译原文]";

/// Renders every request sent for one run.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    base_prompt: String,
    glossary: Glossary,
    placement: GlossaryPlacement,
    model_kind: ModelKind,
    few_shot: Option<String>,
}

impl PromptBuilder {
    pub fn new(
        custom_prompt: Option<&str>,
        glossary: Glossary,
        placement: GlossaryPlacement,
        model_kind: ModelKind,
        few_shot: Option<String>,
    ) -> Self {
        let base_prompt = match custom_prompt.map(str::trim) {
            Some(custom) if !custom.is_empty() => custom.to_owned(),
            _ => DEFAULT_SYSTEM_PROMPT.to_owned(),
        };
        Self {
            base_prompt,
            glossary,
            placement,
            model_kind,
            few_shot: few_shot.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    pub fn system_prompt(&self) -> String {
        if self.placement == GlossaryPlacement::System && !self.glossary.is_empty() {
            return format!("{}{}", self.base_prompt, glossary_block(&self.glossary));
        }
        self.base_prompt.clone()
    }

    /// Glossary block to carry in the assistant prefix instead of the system prompt.
    pub fn assistant_prefix(&self) -> Option<String> {
        if self.placement == GlossaryPlacement::AssistantPrefix && !self.glossary.is_empty() {
            return Some(glossary_block(&self.glossary).trim().to_owned());
        }
        None
    }

    pub fn completion_prompt(&self, text: &str, context: &str) -> String {
        let mut parts = vec![
            "以下是日文轻小说翻译任务。请将【待翻译原文】翻译为流畅的中文，只输出译文。\n".to_owned(),
        ];

        if !self.glossary.is_empty() {
            parts.push("【术语表（必须严格遵守）】".to_owned());
            for (source, target) in self.glossary.iter() {
                parts.push(format!("- {source} → {target}"));
            }
            parts.push(String::new());
        }

        if let Some(few_shot) = &self.few_shot {
            parts.push(few_shot.clone());
            parts.push(String::new());
        }

        if !context.trim().is_empty() {
            parts.push("【前文译文参考（保持人名、称谓一致）】".to_owned());
            parts.push(context.to_owned());
            parts.push(String::new());
        }

        parts.push("【待翻译原文】".to_owned());
        parts.push(text.to_owned());
        parts.push(String::new());
        parts.push("【译文】".to_owned());
        parts.join("\n")
    }

    /// Builds the request for one chunk, shaped for the configured model kind.
    pub fn request(&self, text: &str, context: &str, allow_prefix: bool) -> CompletionRequest {
        match self.model_kind {
            ModelKind::Completion => CompletionRequest {
                system_prompt: String::new(),
                user_content: self.completion_prompt(text, context),
                assistant_prefix: None,
                allow_prefix: false,
                on_delta: None,
            },
            ModelKind::Chat => CompletionRequest {
                system_prompt: self.system_prompt(),
                user_content: user_content(text, context),
                assistant_prefix: self.assistant_prefix(),
                allow_prefix,
                on_delta: None,
            },
        }
    }
}

pub fn glossary_block(glossary: &Glossary) -> String {
    let mut out = String::from("\n【强制术语表】\n");
    for (source, target) in glossary.iter() {
        out.push_str(&format!("- {source} -> {target}\n"));
    }
    out
}

/// Wraps a chunk with the reference-only context envelope.
pub fn user_content(text: &str, context: &str) -> String {
    if context.trim().is_empty() {
        return text.to_owned();
    }
    format!("{CONTEXT_HEADER}\n{context}\n\n{SOURCE_HEADER}\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(placement: GlossaryPlacement) -> PromptBuilder {
        PromptBuilder::new(
            None,
            Glossary::from_pairs([("ウルタス", "厄尔塔斯")]),
            placement,
            ModelKind::Chat,
            None,
        )
    }

    #[test]
    fn system_prompt_carries_glossary_block() {
        let request = builder(GlossaryPlacement::System).request("ウルタスは勇者です", "", true);
        assert!(request.system_prompt.contains("【强制术语表】\n- ウルタス -> 厄尔塔斯\n"));
        assert_eq!(request.user_content, "ウルタスは勇者です");
        assert!(request.assistant_prefix.is_none());
    }

    #[test]
    fn assistant_prefix_placement_renders_mapping_once() {
        let request =
            builder(GlossaryPlacement::AssistantPrefix).request("ウルタスは勇者です", "", true);
        let prefix = request.assistant_prefix.clone().unwrap_or_default();
        let mapping = "- ウルタス -> 厄尔塔斯";
        let occurrences = request.system_prompt.matches(mapping).count()
            + prefix.matches(mapping).count()
            + request.user_content.matches(mapping).count();
        assert_eq!(occurrences, 1);
        assert!(prefix.starts_with("【强制术语表】"));
        assert!(!request.system_prompt.contains("【强制术语表】"));
    }

    #[test]
    fn context_envelope_labels_reference_block() {
        let content = user_content("次の文", "前の訳文");
        assert_eq!(
            content,
            "[前文翻译参考（仅供保持人名、称谓、术语一致，请勿翻译此部分）]\n前の訳文\n\n[待翻译原文]\n次の文"
        );
        assert_eq!(user_content("次の文", " \n"), "次の文");
    }

    #[test]
    fn custom_prompt_replaces_default() {
        let builder = PromptBuilder::new(
            Some("只输出译文。"),
            Glossary::default(),
            GlossaryPlacement::System,
            ModelKind::Chat,
            None,
        );
        assert_eq!(builder.system_prompt(), "只输出译文。");
    }

    #[test]
    fn completion_models_get_a_single_prompt() {
        let builder = PromptBuilder::new(
            None,
            Glossary::from_pairs([("マナ", "魔力素")]),
            GlossaryPlacement::System,
            ModelKind::Completion,
            Some("原文：はい\n译文：是".to_owned()),
        );
        let request = builder.request("マナが満ちる", "魔力素充盈。", true);
        assert!(request.system_prompt.is_empty());
        assert!(!request.allow_prefix);
        let prompt = request.user_content;
        assert!(prompt.contains("- マナ → 魔力素"));
        assert!(prompt.contains("【前文译文参考（保持人名、称谓一致）】\n魔力素充盈。"));
        assert!(prompt.ends_with("【待翻译原文】\nマナが満ちる\n\n【译文】"));
    }
}
