//! The app language and the few strings the core writes into messages.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    #[default]
    Chinese,
    English,
    Japanese,
    Korean,
}

impl Language {
    /// Resolves an app language code such as `zh-Hans`, `en-US` or `system`.
    /// Unknown codes fall back to Chinese.
    pub fn from_code(code: &str) -> Self {
        let code = code.trim().to_ascii_lowercase();
        if code.starts_with("en") {
            Self::English
        } else if code.starts_with("ja") {
            Self::Japanese
        } else if code.starts_with("ko") {
            Self::Korean
        } else {
            Self::Chinese
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Chinese => "zh-Hans",
            Self::English => "en",
            Self::Japanese => "ja",
            Self::Korean => "ko",
        }
    }

    /// English name, used when asking the model for a translation.
    pub fn english_name(self) -> &'static str {
        match self {
            Self::Chinese => "Simplified Chinese",
            Self::English => "English",
            Self::Japanese => "Japanese",
            Self::Korean => "Korean",
        }
    }

    /// First message of an empty conversation.
    pub fn greeting(self) -> &'static str {
        match self {
            Self::Chinese => "こんにちは！我是你的日语外教，今天想聊点什么呢？",
            Self::English => "こんにちは！I'm your Japanese tutor. What would you like to talk about today?",
            Self::Japanese => "こんにちは！日本語の先生です。今日は何について話しましょうか？",
            Self::Korean => "こんにちは！저는 일본어 선생님이에요. 오늘은 무슨 이야기를 해 볼까요?",
        }
    }

    /// Content of an AI message whose stream failed.
    pub fn chat_unavailable(self) -> &'static str {
        match self {
            Self::Chinese => "抱歉，对话服务暂时不可用，请稍后再试。",
            Self::English => "Sorry, the chat service is temporarily unavailable. Please try again later.",
            Self::Japanese => "申し訳ありません。会話サービスは一時的に利用できません。しばらくしてから再度お試しください。",
            Self::Korean => "죄송합니다. 대화 서비스를 일시적으로 사용할 수 없습니다. 잠시 후 다시 시도해 주세요.",
        }
    }

    /// Content of a voice message while it is being transcribed.
    pub fn transcribing(self) -> &'static str {
        match self {
            Self::Chinese => "语音识别中...",
            Self::English => "Transcribing...",
            Self::Japanese => "音声認識中...",
            Self::Korean => "음성 인식 중...",
        }
    }

    /// Content of a voice message whose transcription failed.
    pub fn transcription_failed(self) -> &'static str {
        match self {
            Self::Chinese => "语音识别失败，点击重试",
            Self::English => "Transcription failed. Tap to retry.",
            Self::Japanese => "音声認識に失敗しました。タップして再試行",
            Self::Korean => "음성 인식에 실패했습니다. 탭하여 다시 시도",
        }
    }
}
