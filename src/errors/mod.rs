//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos padronizados para tudo que pode dar errado durante a
//! execução de um cenário, para integração com CI/CD e dashboards.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria              | Descrição                          |
//! |--------|------------------------|------------------------------------|
//! | E1xxx  | Validação              | Erro na definição do cenário       |
//! | E2xxx  | Resolução de deps      | Dependência ausente ou ilegal      |
//! | E3xxx  | Transporte/Timeout     | Erro na requisição HTTP            |
//! | E4xxx  | Assertion              | Expectativa não atendida           |
//! | E5xxx  | Interno                | Bug no próprio runner              |
//!
//! ## Exemplo:
//!
//! ```text
//! [E2003] espera esgotada pela saída de s1/a1 (action: a2)
//! ```
//!
//! Com o código E2003 você sabe que é um problema de resolução de
//! dependências (2xxx), especificamente espera esgotada (003).

use std::fmt;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro com categoria e número.
///
/// Número de 4 dígitos: o primeiro dígito é a categoria (1-5),
/// os três últimos identificam o erro específico.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Validação da definição
    // ========================================================================
    // Problemas detectados antes de executar qualquer coisa.

    /// Nenhuma cena definida na execução.
    pub const EMPTY_RUN: Self = Self(1001);

    /// ID de cena ou action vazio.
    pub const EMPTY_ID: Self = Self(1002);

    /// ID de cena ou action duplicado.
    pub const DUPLICATE_ID: Self = Self(1003);

    /// Campo obrigatório ausente (domain, path ou method).
    pub const MISSING_REQUEST_FIELD: Self = Self(1004);

    /// Método HTTP inválido.
    pub const INVALID_HTTP_METHOD: Self = Self(1005);

    /// Dependência referencia produtor inexistente.
    pub const UNKNOWN_PRODUCER: Self = Self(1006);

    /// Dependência na mesma cena referencia action posterior.
    pub const FORWARD_REFERENCE: Self = Self(1007);

    /// Referência de produtor contém token de placeholder não substituído
    /// (ex.: `$sid`). Chaves são sempre compostas dos IDs reais.
    pub const PLACEHOLDER_PRODUCER_KEY: Self = Self(1008);

    /// Hook com kind desconhecido ou sem duração.
    pub const INVALID_HOOK: Self = Self(1009);

    // ========================================================================
    // E2xxx: Resolução de dependências
    // ========================================================================

    /// Falha ao buscar valor no armazenamento externo de chave-valor.
    pub const KV_FETCH_FAILED: Self = Self(2001);

    /// Caminho (dot-path) não encontrado no valor do produtor.
    pub const DATA_PATH_NOT_FOUND: Self = Self(2002);

    /// Espera pela saída do produtor esgotada (retries ou timeout).
    pub const DEPENDENCY_WAIT_EXHAUSTED: Self = Self(2003);

    /// Segmento intermediário do payload existe mas não é um mapa.
    pub const KEY_NOT_MAP: Self = Self(2004);

    /// Espera interrompida por cancelamento da execução.
    pub const DEPENDENCY_WAIT_CANCELLED: Self = Self(2005);

    // ========================================================================
    // E3xxx: Transporte e timeout
    // ========================================================================

    /// Falha de transporte após esgotar as tentativas.
    pub const TRANSPORT_FAILED: Self = Self(3001);

    /// Deadline da requisição expirou antes do resultado ser aceito.
    pub const SEND_DEADLINE_ELAPSED: Self = Self(3002);

    /// Corpo da resposta não é JSON válido.
    pub const RESPONSE_NOT_JSON: Self = Self(3003);

    /// Timeout da cena inteira expirou.
    pub const SCENE_TIMEOUT: Self = Self(3004);

    /// Execução cancelada externamente.
    pub const RUN_CANCELLED: Self = Self(3005);

    // ========================================================================
    // E4xxx: Assertions
    // ========================================================================

    /// Expectativa não atendida (valor diferente do desejado).
    pub const EXPECTATION_FAILED: Self = Self(4001);

    /// Caminho da expectativa não existe na resposta.
    pub const EXPECTATION_PATH_NOT_FOUND: Self = Self(4002);

    /// Tipo declarado não bate com o valor capturado.
    pub const EXPECTATION_TYPE_MISMATCH: Self = Self(4003);

    /// Tipo declarado desconhecido.
    pub const EXPECTATION_UNKNOWN_TYPE: Self = Self(4004);

    /// Operador desconhecido para o tipo declarado.
    pub const EXPECTATION_UNKNOWN_OPERATOR: Self = Self(4005);

    // ========================================================================
    // E5xxx: Interno
    // ========================================================================

    /// Erro interno inesperado. Se aparecer, reporte.
    pub const INTERNAL: Self = Self(5001);

    /// Retorna o código numérico. Ex.: `ErrorCode::EMPTY_RUN.code() == 1001`.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Retorna o código formatado com prefixo "E". Ex.: "E2003".
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Categoria do erro, derivada do primeiro dígito.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Validation,
            2 => ErrorCategory::DependencyResolution,
            3 => ErrorCategory::Transport,
            4 => ErrorCategory::Assertion,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA
// ============================================================================

/// Categoria de erro, útil para agrupar em relatórios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    DependencyResolution,
    Transport,
    Assertion,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "Validação"),
            Self::DependencyResolution => write!(f, "Resolução de dependências"),
            Self::Transport => write!(f, "Transporte"),
            Self::Assertion => write!(f, "Assertion"),
            Self::Internal => write!(f, "Interno"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}
