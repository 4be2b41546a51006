use page_translator::analysis::{TOOL_NAME, render_system_prompt};
use page_translator::languages::LanguageRegistry;

#[test]
fn system_prompt_snapshot() {
    let registry = LanguageRegistry::load().unwrap();
    let prompt = render_system_prompt(&registry.label("ja"), TOOL_NAME).unwrap();
    insta::assert_snapshot!(prompt);
}
