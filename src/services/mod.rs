pub mod chapterizer;
pub mod epub;
pub mod library;
pub mod llm;
