/// User-facing text, per reply locale.
use crate::config::Locale;
use crate::state::ImageResult;

/// Localized message catalog.
#[derive(Debug, Clone, Copy)]
pub struct Messages {
    locale: Locale,
}

impl Messages {
    pub fn new(locale: Locale) -> Self {
        Self { locale }
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    /// Instruction appended to prompts that produce user-facing replies.
    pub fn language_rule(&self) -> &'static str {
        match self.locale {
            Locale::Zh => "请始终使用中文回复用户。",
            Locale::En => "Always reply to the user in English.",
        }
    }

    pub fn assessment_failed(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，我在理解您的需求时遇到了问题。请尝试重新描述您想要的图像，或使用更简单的语言。".to_string(),
            Locale::En => "Sorry, I had trouble understanding your request. Please try describing the image again, or use simpler wording.".to_string(),
        }
    }

    /// Reply used when the model decides no image is needed but gives no answer.
    pub fn no_image_needed(&self) -> String {
        match self.locale {
            Locale::Zh => "我是VisionWeaver图像生成助手。如果您需要生成或设计图片，请描述您想要的画面。".to_string(),
            Locale::En => "I'm VisionWeaver, an image generation assistant. Describe the picture you'd like and I'll design and generate it.".to_string(),
        }
    }

    pub fn design_rejected(&self, detail: &str) -> String {
        match self.locale {
            Locale::Zh => format!("抱歉，在分析您的设计需求时遇到了问题: {}。请尝试提供更详细的描述。", detail),
            Locale::En => format!(
                "Sorry, I couldn't analyze your design request: {}. Please try a more detailed description.",
                detail
            ),
        }
    }

    pub fn design_failed(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在分析您的设计需求时遇到了技术问题。请稍后再试。".to_string(),
            Locale::En => "Sorry, I couldn't analyze your design request because of a technical problem. Please try again later.".to_string(),
        }
    }

    pub fn missing_design(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在准备生成图像时遇到了问题。系统未能获取到设计方案。".to_string(),
            Locale::En => "Sorry, something went wrong while preparing the image: no design brief was available.".to_string(),
        }
    }

    pub fn generation_rejected(&self, detail: &str) -> String {
        match self.locale {
            Locale::Zh => format!("抱歉，在生成图像时遇到了问题: {}。请尝试使用不同的描述。", detail),
            Locale::En => format!(
                "Sorry, I ran into a problem generating the image: {}. Please try a different description.",
                detail
            ),
        }
    }

    pub fn generation_failed(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在生成图像时遇到了技术问题。请稍后再试。".to_string(),
            Locale::En => "Sorry, image generation failed because of a technical problem. Please try again later.".to_string(),
        }
    }

    /// Deterministic notice prepended when the summary came back in the wrong language.
    pub fn image_ready_notice(&self, image: &ImageResult) -> String {
        let mut notice = match self.locale {
            Locale::Zh => "您的图片已成功生成！请在系统中查看生成的图片。".to_string(),
            Locale::En => "Your image has been generated successfully. You can view it in the system.".to_string(),
        };

        if let Some(url) = &image.url {
            match self.locale {
                Locale::Zh => notice.push_str(&format!("\n图片地址: {}", url)),
                Locale::En => notice.push_str(&format!("\nImage URL: {}", url)),
            }
        }

        if let Some(path) = &image.local_path {
            match self.locale {
                Locale::Zh => notice.push_str(&format!("\n本地保存路径: {}", path.display())),
                Locale::En => notice.push_str(&format!("\nSaved locally at: {}", path.display())),
            }
        }

        notice
    }

    pub fn missing_overlay(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，您没有提供需要合成的图像（如logo或二维码）。请提供至少一张图像用于合成。".to_string(),
            Locale::En => "Sorry, no overlay image (such as a logo or QR code) was provided. Please attach at least one image to composite.".to_string(),
        }
    }

    pub fn missing_generated_image(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在准备合成图像时遇到了问题。系统未能找到生成的图像。".to_string(),
            Locale::En => "Sorry, something went wrong while preparing the composition: the generated image could not be found.".to_string(),
        }
    }

    pub fn download_failed(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在准备合成图像时遇到了问题。系统无法下载生成的图像。".to_string(),
            Locale::En => "Sorry, something went wrong while preparing the composition: the generated image could not be downloaded.".to_string(),
        }
    }

    pub fn composition_rejected(&self, detail: &str) -> String {
        match self.locale {
            Locale::Zh => format!("抱歉，在合成图像时遇到了问题: {}", detail),
            Locale::En => format!("Sorry, I ran into a problem compositing the image: {}", detail),
        }
    }

    pub fn composition_failed(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，图像合成过程中发生了问题。请稍后重试。".to_string(),
            Locale::En => "Sorry, something went wrong while compositing the image. Please try again later.".to_string(),
        }
    }

    pub fn internal_error(&self) -> String {
        match self.locale {
            Locale::Zh => "抱歉，在处理您的请求时遇到了问题。请再试一次或尝试其他描述方式。".to_string(),
            Locale::En => "Sorry, something went wrong while processing your request. Please try again or rephrase it.".to_string(),
        }
    }
}
